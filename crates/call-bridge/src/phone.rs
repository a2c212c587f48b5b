//! Phone number normalization
//!
//! Raw numbers arrive in every shape a switch or an address book can produce:
//! `+49 (89) 1234-5678`, `0049891234 5678`, `089/12345678`. Two forms are used
//! throughout the engine:
//!
//! - [`normalize`]: digits only, international prefix reduced to the bare
//!   country code. Used for routing-cache keys.
//! - [`normalize_for_comparison`]: the last `max_len` digits of [`normalize`].
//!   Used for directory index keys and pending-dial keys, so that national and
//!   international spellings of the same number compare equal.

/// Reduce a raw number to its canonical digit string
///
/// Empty or whitespace-only input yields an empty string. Idempotent.
///
/// # Examples
///
/// ```rust
/// # use callbridge_core::phone::normalize;
/// assert_eq!(normalize("+49 (89) 1234-5678"), "498912345678");
/// assert_eq!(normalize("0049 89 12345678"), "498912345678");
/// assert_eq!(normalize("   "), "");
/// ```
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits: String = without_plus.chars().filter(|c| c.is_ascii_digit()).collect();

    // "00" is the international dial prefix; repeated so the result never starts with it
    let mut rest = digits.as_str();
    while let Some(stripped) = rest.strip_prefix("00") {
        rest = stripped;
    }
    rest.to_string()
}

/// Normalize, then keep only the trailing `max_len` digits
///
/// `max_len == 0` disables truncation.
///
/// ```rust
/// # use callbridge_core::phone::normalize_for_comparison;
/// // national and international spellings meet in the last ten digits
/// assert_eq!(normalize_for_comparison("089/12345678", 10), "8912345678");
/// assert_eq!(normalize_for_comparison("+49 89 12345678", 10), "8912345678");
/// assert_eq!(normalize_for_comparison("+49 89 12345678", 0), "498912345678");
/// ```
pub fn normalize_for_comparison(raw: &str, max_len: usize) -> String {
    let normalized = normalize(raw);
    if max_len == 0 || normalized.len() <= max_len {
        return normalized;
    }
    normalized[normalized.len() - max_len..].to_string()
}
