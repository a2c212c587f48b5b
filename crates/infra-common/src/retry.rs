//! Bounded exponential-backoff retry
//!
//! Retry applies within one logical operation (a directory reload, a transport
//! reconnect). The delay before retry `n` is `base_delay * 2^n`, capped at
//! `max_delay`. Only errors that classify themselves as transient are retried;
//! anything else fails on the first attempt.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Classification used by [`retry_with_backoff`]
pub trait Retryable {
    /// Whether another attempt may succeed (timeouts, I/O, malformed responses)
    fn is_transient(&self) -> bool;

    /// Short label used as a structured log field
    fn category(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else {
            "permanent"
        }
    }
}

/// Configuration for retry behavior
///
/// # Examples
///
/// ```rust
/// # use callbridge_infra_common::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::default();
/// assert_eq!(config.delay_for_attempt(0), Duration::from_millis(200));
/// assert_eq!(config.delay_for_attempt(2), Duration::from_millis(800));
///
/// // capped at max_delay
/// assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
///
/// // reconnect loops keep trying
/// assert_eq!(RetryConfig::slow().max_retries, u32::MAX);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Add +/-10% jitter to each delay
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            use_jitter: false,
        }
    }
}

impl RetryConfig {
    /// Short delays for operations that usually recover quickly
    pub fn quick() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            use_jitter: true,
        }
    }

    /// Conservative delays for reconnect loops
    pub fn slow() -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            use_jitter: true,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Delay before retry number `attempt`, with jitter applied if configured
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        let millis = delay.as_millis() as f64;
        Duration::from_millis((millis * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Retry an operation with exponential backoff
///
/// `operation` is invoked once, then up to `config.max_retries` more times while it
/// keeps failing with a transient error. The final error is returned unchanged.
///
/// ```rust,no_run
/// # use callbridge_infra_common::{retry_with_backoff, RetryConfig, Retryable};
/// # #[derive(Debug)]
/// # struct LoadError;
/// # impl std::fmt::Display for LoadError {
/// #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("busy") }
/// # }
/// # impl Retryable for LoadError {
/// #     fn is_transient(&self) -> bool { true }
/// # }
/// # async fn load_contacts() -> Result<Vec<String>, LoadError> { Ok(Vec::new()) }
/// # async fn example() -> Result<(), LoadError> {
/// let contacts = retry_with_backoff("contact_load", &RetryConfig::quick(), || load_contacts()).await?;
/// println!("{} contacts", contacts.len());
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;

    loop {
        debug!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_retries.saturating_add(1),
            "Attempting operation"
        );

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = config.jittered_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %e,
                    category = e.category(),
                    next_delay_ms = delay.as_millis() as u64,
                    "Transient error, will retry"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                } else {
                    error!(
                        operation = operation_name,
                        error = %e,
                        category = e.category(),
                        "Non-transient error, not retrying"
                    );
                }
                return Err(e);
            }
        }
    }
}
