//! Call registry
//!
//! Owns every live [`CallRecord`] and every [`PendingOutboundCall`]. Records are
//! shared as `Arc<Mutex<CallRecord>>` so transitions for one call serialize on
//! that call's lock while other calls proceed untouched.
//!
//! Never call back into the registry while holding a record lock.

mod record;

pub use record::{CallId, CallRecord, PendingOutboundCall};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::phone::normalize_for_comparison;

pub type SharedRecord = Arc<Mutex<CallRecord>>;

// Pending dials are keyed by the comparison form, so the switch may report
// the dialed number in any spelling:
//
//     registry.register_pending("+4989112233", "S1", None)?;
//     registry.try_consume_pending("004989112233")  // Some(S1)

/// What a sweep removed
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub stale_calls: Vec<CallId>,
    pub expired_dials: Vec<PendingOutboundCall>,
}

pub struct CallRegistry {
    calls: DashMap<CallId, SharedRecord>,
    pending: DashMap<String, PendingOutboundCall>,
    comparison_length: AtomicUsize,
}

impl CallRegistry {
    pub fn new(comparison_length: usize) -> Self {
        Self {
            calls: DashMap::new(),
            pending: DashMap::new(),
            comparison_length: AtomicUsize::new(comparison_length),
        }
    }

    /// Fetch the record for `call_id`, creating it atomically if absent
    ///
    /// The flag is `true` when this call created the record.
    pub fn get_or_create<F>(&self, call_id: &CallId, factory: F) -> (SharedRecord, bool)
    where
        F: FnOnce() -> CallRecord,
    {
        match self.calls.entry(call_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let record = Arc::new(Mutex::new(factory()));
                entry.insert(record.clone());
                (record, true)
            }
        }
    }

    pub fn get(&self, call_id: &CallId) -> Option<SharedRecord> {
        self.calls.get(call_id).map(|r| r.value().clone())
    }

    pub fn remove(&self, call_id: &CallId) -> Option<SharedRecord> {
        self.calls.remove(call_id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Snapshots of every live call
    pub fn active_calls(&self) -> Vec<CallRecord> {
        let records: Vec<SharedRecord> = self.calls.iter().map(|r| r.value().clone()).collect();
        records.iter().map(|r| r.lock().clone()).collect()
    }

    pub fn find_by_sync_id(&self, sync_id: &str) -> Option<SharedRecord> {
        let records: Vec<SharedRecord> = self.calls.iter().map(|r| r.value().clone()).collect();
        records
            .into_iter()
            .find(|r| r.lock().sync_id.as_deref() == Some(sync_id))
    }

    pub fn set_comparison_length(&self, comparison_length: usize) {
        self.comparison_length.store(comparison_length, Ordering::Relaxed);
    }

    fn pending_key(&self, number: &str) -> String {
        normalize_for_comparison(number, self.comparison_length.load(Ordering::Relaxed))
    }

    /// Remember a click-to-dial request; a newer request for the same number replaces the older
    pub fn register_pending(
        &self,
        destination_number: &str,
        sync_id: &str,
        contact_hint: Option<String>,
    ) -> Result<PendingOutboundCall> {
        let key = self.pending_key(destination_number);
        if key.is_empty() {
            return Err(BridgeError::InvalidDestination {
                number: destination_number.to_string(),
            });
        }

        let pending = PendingOutboundCall {
            destination_number: destination_number.to_string(),
            key: key.clone(),
            sync_id: sync_id.to_string(),
            contact_hint,
            created_at: Instant::now(),
        };
        if let Some(replaced) = self.pending.insert(key.clone(), pending.clone()) {
            info!(number = %key, replaced_sync_id = %replaced.sync_id, "Replacing pending dial request");
        }
        debug!(number = %key, sync_id = sync_id, "Registered pending dial request");
        Ok(pending)
    }

    /// Atomically claim the pending request for an outbound number
    pub fn try_consume_pending(&self, number: &str) -> Option<PendingOutboundCall> {
        let key = self.pending_key(number);
        if key.is_empty() {
            return None;
        }
        self.pending.remove(&key).map(|(_, pending)| pending)
    }

    /// Remove the pending request registered under `key` if it still belongs to `sync_id`
    pub fn remove_pending(&self, key: &str, sync_id: &str) -> Option<PendingOutboundCall> {
        self.pending
            .remove_if(key, |_, pending| pending.sync_id == sync_id)
            .map(|(_, pending)| pending)
    }

    pub fn cancel_pending_by_sync_id(&self, sync_id: &str) -> Option<PendingOutboundCall> {
        let key = self
            .pending
            .iter()
            .find(|p| p.value().sync_id == sync_id)
            .map(|p| p.key().clone())?;
        self.remove_pending(&key, sync_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove calls idle for longer than `stale_timeout` and unmatched dial
    /// requests older than `pending_timeout`
    pub fn sweep(&self, stale_timeout: Duration, pending_timeout: Duration) -> SweepReport {
        let records: Vec<(CallId, SharedRecord)> = self
            .calls
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let mut report = SweepReport::default();
        for (call_id, record) in records {
            if record.lock().last_activity.elapsed() > stale_timeout {
                self.calls.remove(&call_id);
                report.stale_calls.push(call_id);
            }
        }

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|p| p.value().created_at.elapsed() > pending_timeout)
            .map(|p| p.key().clone())
            .collect();
        for key in expired {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&key, |_, p| p.created_at.elapsed() > pending_timeout)
            {
                report.expired_dials.push(pending);
            }
        }

        if !report.stale_calls.is_empty() || !report.expired_dials.is_empty() {
            info!(
                stale_calls = report.stale_calls.len(),
                expired_dials = report.expired_dials.len(),
                "Registry sweep removed entries"
            );
        }
        report
    }
}
