//! Contact directory with phone-number index
//!
//! The directory holds an immutable [`ContactIndex`] snapshot behind an
//! `Arc`. Lookups clone the `Arc` under a brief read lock and work on the
//! snapshot; loads build a complete new index first and swap it in under the
//! write lock, so a reader never observes a half-built index.
//!
//! Lookup order:
//! 1. exact match on the comparison-normalized key
//! 2. suffix match over keys of at least [`MIN_SUFFIX_MATCH_LENGTH`] digits,
//!    choosing the longest overlap (ties go to the key seen first in index order)

use std::collections::BTreeMap;
use std::sync::Arc;

use callbridge_infra_common::{retry_with_backoff, RetryConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accounting::ContactSource;
use crate::error::{BridgeError, Result};
use crate::phone::{normalize, normalize_for_comparison};
use crate::routing::RoutingCandidate;

/// Shortest key or overlap considered by suffix matching
pub const MIN_SUFFIX_MATCH_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCommunication {
    pub raw_number: String,
    pub normalized_number: String,
}

impl ContactCommunication {
    pub fn new(raw_number: impl Into<String>) -> Self {
        let raw_number = raw_number.into();
        let normalized_number = normalize(&raw_number);
        Self {
            raw_number,
            normalized_number,
        }
    }
}

/// Address-book entry of the accounting system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub is_person: bool,
    pub is_recipient_kind: bool,
    pub communications: Vec<ContactCommunication>,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_person: true,
            is_recipient_kind: false,
            communications: Vec::new(),
        }
    }

    pub fn with_number(mut self, raw_number: impl Into<String>) -> Self {
        self.communications.push(ContactCommunication::new(raw_number));
        self
    }

    pub fn organization(mut self) -> Self {
        self.is_person = false;
        self
    }

    pub fn recipient(mut self) -> Self {
        self.is_recipient_kind = true;
        self
    }
}

/// One contact reached through one of its numbers
#[derive(Debug, Clone)]
pub struct ContactMatch {
    pub contact: Arc<Contact>,
    pub communication: ContactCommunication,
}

impl ContactMatch {
    pub fn contact_id(&self) -> &str {
        &self.contact.id
    }

    pub fn contact_name(&self) -> &str {
        &self.contact.name
    }
}

impl RoutingCandidate for ContactMatch {
    fn candidate_id(&self) -> &str {
        self.contact_id()
    }
}

/// Immutable index snapshot
///
/// # Examples
///
/// ```rust
/// # use callbridge_core::{Contact, ContactIndex};
/// let index = ContactIndex::build(
///     [
///         Contact::new("a", "Anna Berg").with_number("+49 89 11112222"),
///         Contact::new("b", "Berg Consulting").organization().with_number("089 11112222"),
///     ],
///     10,
/// );
///
/// // exact match on the comparison key, in load order
/// let matches = index.lookup("0049 89 1111 2222");
/// let ids: Vec<&str> = matches.iter().map(|m| m.contact_id()).collect();
/// assert_eq!(ids, ["a", "b"]);
///
/// // suffix match needs an overlap of at least six digits
/// assert_eq!(index.lookup("1111 2222").len(), 2);
/// assert!(index.lookup("2222").is_empty());
/// ```
#[derive(Debug, Default)]
pub struct ContactIndex {
    comparison_length: usize,
    contacts: Vec<Arc<Contact>>,
    entries: BTreeMap<String, Vec<ContactMatch>>,
}

impl ContactIndex {
    /// Build an index, dropping numbers that normalize to nothing
    ///
    /// Contacts left without any usable number are skipped entirely.
    pub fn build(contacts: impl IntoIterator<Item = Contact>, comparison_length: usize) -> Self {
        let mut index = ContactIndex {
            comparison_length,
            ..Default::default()
        };

        for mut contact in contacts {
            contact.communications = contact
                .communications
                .into_iter()
                .map(|mut c| {
                    if c.normalized_number.is_empty() {
                        c.normalized_number = normalize(&c.raw_number);
                    }
                    c
                })
                .filter(|c| !c.normalized_number.is_empty())
                .collect();
            if contact.communications.is_empty() {
                debug!(contact_id = %contact.id, "Skipping contact without usable number");
                continue;
            }

            let contact = Arc::new(contact);
            for communication in &contact.communications {
                let key = normalize_for_comparison(&communication.normalized_number, comparison_length);
                let matches = index.entries.entry(key).or_default();
                if matches.iter().any(|m| m.contact.id == contact.id) {
                    continue;
                }
                matches.push(ContactMatch {
                    contact: contact.clone(),
                    communication: communication.clone(),
                });
            }
            index.contacts.push(contact);
        }

        index
    }

    pub fn lookup(&self, raw_number: &str) -> Vec<ContactMatch> {
        let input = normalize_for_comparison(raw_number, self.comparison_length);
        if input.is_empty() {
            return Vec::new();
        }

        if let Some(matches) = self.entries.get(&input) {
            if !matches.is_empty() {
                return matches.clone();
            }
        }

        let mut best: Option<(usize, &Vec<ContactMatch>)> = None;
        for (key, matches) in &self.entries {
            if key.len() < MIN_SUFFIX_MATCH_LENGTH || matches.is_empty() {
                continue;
            }
            let overlap = if input.ends_with(key.as_str()) {
                key.len()
            } else if key.ends_with(input.as_str()) {
                input.len()
            } else {
                continue;
            };
            if overlap < MIN_SUFFIX_MATCH_LENGTH {
                continue;
            }
            if best.map_or(true, |(longest, _)| overlap > longest) {
                best = Some((overlap, matches));
            }
        }

        best.map(|(_, matches)| matches.clone()).unwrap_or_default()
    }

    pub fn comparison_length(&self) -> usize {
        self.comparison_length
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

/// Shared directory handle
pub struct ContactDirectory {
    index: RwLock<Arc<ContactIndex>>,
}

impl ContactDirectory {
    pub fn new(comparison_length: usize) -> Self {
        Self {
            index: RwLock::new(Arc::new(ContactIndex {
                comparison_length,
                ..Default::default()
            })),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ContactIndex> {
        self.index.read().clone()
    }

    /// Replace the whole contact set; returns the number of contacts indexed
    pub fn load(&self, contacts: Vec<Contact>) -> usize {
        let comparison_length = self.snapshot().comparison_length;
        let total = contacts.len();
        let index = ContactIndex::build(contacts, comparison_length);
        let loaded = index.contact_count();

        *self.index.write() = Arc::new(index);
        info!(
            contacts = loaded,
            skipped = total - loaded,
            comparison_length = comparison_length,
            "Contact directory loaded"
        );
        loaded
    }

    /// Reload from `source`, retrying transient failures
    ///
    /// On failure the previous snapshot stays in service.
    pub async fn reload(&self, source: &dyn ContactSource, retry: &RetryConfig) -> Result<usize> {
        match retry_with_backoff("directory_reload", retry, || source.load_contacts()).await {
            Ok(contacts) => Ok(self.load(contacts)),
            Err(e) => {
                warn!(
                    error = %e,
                    contacts = self.contact_count(),
                    "Directory reload failed, keeping previous contacts"
                );
                Err(BridgeError::from(e))
            }
        }
    }

    /// Rebuild the index for a new comparison length
    pub fn set_comparison_length(&self, comparison_length: usize) {
        let current = self.snapshot();
        if current.comparison_length == comparison_length {
            return;
        }
        let contacts: Vec<Contact> = current.contacts.iter().map(|c| c.as_ref().clone()).collect();
        let index = ContactIndex::build(contacts, comparison_length);
        *self.index.write() = Arc::new(index);
        info!(comparison_length = comparison_length, "Contact index rebuilt");
    }

    pub fn lookup(&self, raw_number: &str) -> Vec<ContactMatch> {
        self.snapshot().lookup(raw_number)
    }

    pub fn comparison_length(&self) -> usize {
        self.snapshot().comparison_length
    }

    pub fn contact_count(&self) -> usize {
        self.snapshot().contact_count()
    }

    pub fn key_count(&self) -> usize {
        self.snapshot().key_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccountingError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ids(matches: &[ContactMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.contact_id()).collect()
    }

    #[test]
    fn test_exact_match_wins_over_suffix() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![
            Contact::new("exact", "Exact").with_number("089 12345678"),
            Contact::new("suffix", "Suffix").with_number("5678"),
            Contact::new("longer", "Longer").with_number("12345678"),
        ]);

        assert_eq!(ids(&directory.lookup("+49 89 12345678")), vec!["exact"]);
    }

    #[test]
    fn test_suffix_prefers_longest_overlap() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![
            Contact::new("six", "Six").with_number("234567"),
            Contact::new("seven", "Seven").with_number("1234567"),
        ]);

        assert_eq!(ids(&directory.lookup("999 1234567")), vec!["seven"]);
        assert_eq!(ids(&directory.lookup("888 0234567")), vec!["six"]);
    }

    #[test]
    fn test_short_fragments_never_match() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![Contact::new("short", "Short").with_number("4567")]);

        assert!(directory.lookup("0891234567").is_empty());
        assert!(directory.lookup("").is_empty());
    }

    #[test]
    fn test_key_longer_than_input_matches_by_suffix() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![Contact::new("full", "Full").with_number("+49 89 11112222")]);

        // Caller id without area code
        assert_eq!(ids(&directory.lookup("11112222")), vec!["full"]);
    }

    #[test]
    fn test_shared_number_returns_all_contacts_in_load_order() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![
            Contact::new("a", "Alice").with_number("+49 89 11112222"),
            Contact::new("b", "Bob").with_number("089 11112222"),
            Contact::new("none", "Nobody").with_number("n/a"),
        ]);

        assert_eq!(ids(&directory.lookup("+49 89 11112222")), vec!["a", "b"]);
        assert_eq!(directory.contact_count(), 2);
        assert_eq!(directory.key_count(), 1);
    }

    #[test]
    fn test_set_comparison_length_rebuilds_keys() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![Contact::new("a", "Alice").with_number("+49 89 11112222")]);
        assert_eq!(directory.snapshot().entries.keys().next().map(String::as_str), Some("8911112222"));

        directory.set_comparison_length(0);
        assert_eq!(directory.comparison_length(), 0);
        assert_eq!(directory.snapshot().entries.keys().next().map(String::as_str), Some("498911112222"));
        assert_eq!(ids(&directory.lookup("0049 89 11112222")), vec!["a"]);
    }

    struct FlakySource {
        calls: AtomicU32,
        fail_first: u32,
        error: AccountingError,
    }

    #[async_trait]
    impl ContactSource for FlakySource {
        async fn load_contacts(&self) -> std::result::Result<Vec<Contact>, AccountingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(vec![Contact::new("fresh", "Fresh").with_number("0891234567")])
        }
    }

    fn retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 100,
            use_jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_retries_transient_failures() {
        let directory = ContactDirectory::new(10);
        let source = FlakySource {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: AccountingError::unreachable("starting up"),
        };

        let loaded = directory.reload(&source, &retry(3)).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_keeps_last_snapshot() {
        let directory = ContactDirectory::new(10);
        directory.load(vec![Contact::new("old", "Old").with_number("0891112222")]);

        let source = FlakySource {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: AccountingError::rejected("no permission"),
        };

        assert!(directory.reload(&source, &retry(3)).await.is_err());
        // Non-transient: exactly one attempt
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ids(&directory.lookup("0891112222")), vec!["old"]);
    }
}
