//! Processor counters, read through [`ProcessorStats`] snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters readable at any time through [`super::CallEventProcessor::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub events_received: u64,
    /// Duplicates of the previous state tag for the same call
    pub events_debounced: u64,
    pub transitions_rejected: u64,
    pub notifications_sent: u64,
    /// Notifications short-circuited by the open circuit
    pub notifications_skipped: u64,
    pub notifications_failed: u64,
    pub calls_completed: u64,
    /// Finished calls the history store did not accept
    pub history_failures: u64,
    /// Accounting reachability checks that found the system down
    pub probes_failed: u64,
    /// Per-call lanes currently alive in the run loop
    pub lanes_open: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub events_received: AtomicU64,
    pub events_debounced: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_skipped: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub calls_completed: AtomicU64,
    pub history_failures: AtomicU64,
    pub probes_failed: AtomicU64,
    pub lanes_open: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn drop_one(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

impl Counters {
    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_debounced: self.events_debounced.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_skipped: self.notifications_skipped.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            lanes_open: self.lanes_open.load(Ordering::Relaxed),
        }
    }
}
