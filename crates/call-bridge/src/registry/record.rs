//! The per-call record kept by the registry

use std::fmt;

use callbridge_transport::{CallDirection, CallEvent, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::directory::ContactMatch;
use crate::state::CallState;

/// Registry key: `<transport>:<transport call id>`
///
/// Qualifying with the transport keeps two transports that number their calls
/// independently from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(transport: TransportKind, transport_call_id: &str) -> Self {
        Self(format!("{}:{}", transport.as_str(), transport_call_id))
    }

    pub fn for_event(event: &CallEvent) -> Self {
        Self::new(event.transport, &event.transport_call_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything known about one live call
///
/// `call_state` is written only by [`crate::state::CallStateMachine`].
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: CallId,
    pub transport: TransportKind,
    pub transport_call_id: String,
    pub direction: CallDirection,
    pub remote_number: String,
    pub remote_name: Option<String>,
    pub local_extension: Option<String>,
    pub start_time: DateTime<Utc>,
    pub connected_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub(crate) call_state: CallState,
    /// Contact currently attached to the call
    pub resolved_contact: Option<ContactMatch>,
    /// Every contact the number matched, routed order
    pub candidates: Vec<ContactMatch>,
    pub sync_id: Option<String>,
    pub contact_hint: Option<String>,
    pub(crate) last_activity: Instant,
}

impl CallRecord {
    /// New record in `Idle`, seeded from the call's first event
    pub fn from_event(call_id: CallId, event: &CallEvent, fallback_extension: Option<String>) -> Self {
        Self {
            call_id,
            transport: event.transport,
            transport_call_id: event.transport_call_id.clone(),
            direction: event.direction,
            remote_number: event.raw_remote_number.clone(),
            remote_name: event.raw_remote_name.clone(),
            local_extension: event.extension_hint.clone().or(fallback_extension),
            start_time: event.timestamp,
            connected_time: None,
            end_time: None,
            call_state: CallState::Idle,
            resolved_contact: None,
            candidates: Vec::new(),
            sync_id: None,
            contact_hint: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> CallState {
        self.call_state
    }

    /// Fill in caller details a later event knows but the first one did not
    pub fn merge_event_details(&mut self, event: &CallEvent) {
        if self.remote_number.is_empty() && !event.raw_remote_number.is_empty() {
            self.remote_number = event.raw_remote_number.clone();
        }
        if self.remote_name.is_none() {
            self.remote_name = event.raw_remote_name.clone();
        }
        if self.local_extension.is_none() {
            self.local_extension = event.extension_hint.clone();
        }
        self.last_activity = Instant::now();
    }

    /// Talk time, when the call was connected and has ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_time, self.end_time) {
            (Some(connected), Some(ended)) => Some(ended - connected),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }

    pub fn contact_id(&self) -> Option<&str> {
        self.resolved_contact.as_ref().map(|m| m.contact_id())
    }
}

/// Click-to-dial request waiting for its transport event
#[derive(Debug, Clone)]
pub struct PendingOutboundCall {
    pub destination_number: String,
    /// Comparison-normalized destination, the pending map key
    pub key: String,
    pub sync_id: String,
    pub contact_hint: Option<String>,
    pub created_at: Instant,
}
