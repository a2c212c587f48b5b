//! Recency-based contact routing
//!
//! Remembers which contact was last chosen for a number and moves that contact
//! to the front of later candidate lists, for as long as the routing window
//! lasts. Keys use the full normalized number, not the comparison suffix.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::phone::normalize;

/// Anything that can be reordered by the routing cache
pub trait RoutingCandidate {
    fn candidate_id(&self) -> &str;
}

#[derive(Debug, Clone)]
struct RoutingEntry {
    contact_id: String,
    recorded_at: Instant,
}

/// Contact preferences per number, each valid for the routing window
///
/// # Examples
///
/// ```rust
/// # use std::time::Duration;
/// # use callbridge_core::{Contact, ContactIndex, RoutingCache};
/// let index = ContactIndex::build(
///     [
///         Contact::new("a", "Anna Berg").with_number("0891112222"),
///         Contact::new("b", "Berg Consulting").with_number("0891112222"),
///     ],
///     10,
/// );
/// let cache = RoutingCache::new(Duration::from_secs(600));
/// cache.record_usage("+49 89 1112222", "b");
///
/// let routed = cache.apply_routing("+49 89 1112222", index.lookup("0891112222"));
/// assert_eq!(routed[0].contact_id(), "b");
/// assert_eq!(routed.len(), 2);
/// ```
pub struct RoutingCache {
    entries: DashMap<String, RoutingEntry>,
    window: Duration,
}

impl RoutingCache {
    /// A zero window disables routing
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Remember `contact_id` as the choice for `phone_number`
    pub fn record_usage(&self, phone_number: &str, contact_id: &str) {
        let key = normalize(phone_number);
        if key.is_empty() || contact_id.is_empty() {
            return;
        }
        debug!(number = %key, contact_id = contact_id, "Recording contact routing");
        self.entries.insert(
            key,
            RoutingEntry {
                contact_id: contact_id.to_string(),
                recorded_at: Instant::now(),
            },
        );
    }

    /// Move the remembered contact to the front; never adds or removes candidates
    pub fn apply_routing<T: RoutingCandidate>(&self, phone_number: &str, mut candidates: Vec<T>) -> Vec<T> {
        if candidates.len() < 2 || self.window.is_zero() {
            return candidates;
        }
        let key = normalize(phone_number);

        let cached = match self.entries.get(&key) {
            Some(entry) if entry.recorded_at.elapsed() <= self.window => Some(entry.contact_id.clone()),
            Some(_) => None,
            None => return candidates,
        };

        let Some(contact_id) = cached else {
            self.entries
                .remove_if(&key, |_, entry| entry.recorded_at.elapsed() > self.window);
            debug!(number = %key, "Routing entry expired");
            return candidates;
        };

        if let Some(position) = candidates.iter().position(|c| c.candidate_id() == contact_id) {
            if position > 0 {
                let preferred = candidates.remove(position);
                candidates.insert(0, preferred);
                debug!(number = %key, contact_id = %contact_id, "Routing moved contact to front");
            }
        }
        candidates
    }

    /// Contact currently remembered for a number, if still inside the window
    pub fn preferred_contact(&self, phone_number: &str) -> Option<String> {
        let entry = self.entries.get(&normalize(phone_number))?;
        (entry.recorded_at.elapsed() <= self.window).then(|| entry.contact_id.clone())
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries.retain(|_, entry| entry.recorded_at.elapsed() <= window);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
