//! Call state machine
//!
//! ```text
//!            +-> Offering -+
//!   Idle ----+             +-> Ringback -+
//!            +-> Dialing --+             +-> Accepted -> Connected -> Disconnected
//!                          +-------------+
//! ```
//!
//! Any non-terminal state may also go straight to `Disconnected`. The table in
//! [`CallState::allowed_next`] is the whole truth; everything else is rejected.

use std::fmt;

use callbridge_transport::StateTag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::CallRecord;

/// Lifecycle state of a call record
///
/// ```rust
/// # use callbridge_core::CallState;
/// assert!(CallState::Offering.can_transition_to(CallState::Connected));
/// assert!(CallState::Ringback.can_transition_to(CallState::Disconnected));
/// assert!(!CallState::Connected.can_transition_to(CallState::Offering));
/// assert!(CallState::Disconnected.allowed_next().is_empty());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Record created, no transition applied yet
    Idle,
    Offering,
    Dialing,
    Ringback,
    Accepted,
    Connected,
    Disconnected,
}

impl CallState {
    pub fn allowed_next(&self) -> &'static [CallState] {
        use CallState::*;
        match self {
            Idle => &[Offering, Dialing],
            Offering => &[Accepted, Connected, Disconnected],
            Dialing => &[Ringback, Accepted, Connected, Disconnected],
            Ringback => &[Accepted, Connected, Disconnected],
            Accepted => &[Connected, Disconnected],
            Connected => &[Disconnected],
            Disconnected => &[],
        }
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::Dialing => "dialing",
            CallState::Ringback => "ringback",
            CallState::Accepted => "accepted",
            CallState::Connected => "connected",
            CallState::Disconnected => "disconnected",
        }
    }
}

impl From<StateTag> for CallState {
    fn from(tag: StateTag) -> Self {
        match tag {
            StateTag::Offered => CallState::Offering,
            StateTag::Dialing => CallState::Dialing,
            StateTag::Ringback => CallState::Ringback,
            StateTag::Accepted => CallState::Accepted,
            StateTag::Connected => CallState::Connected,
            StateTag::Ended => CallState::Disconnected,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: CallState, to: CallState },
    /// Re-application of the terminal state
    NoOp,
    Rejected { from: CallState, to: CallState },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// The only writer of [`CallRecord`] state
pub struct CallStateMachine;

impl CallStateMachine {
    /// Apply `to` at time `at`, stamping connect and end times
    pub fn apply(record: &mut CallRecord, to: CallState, at: DateTime<Utc>) -> TransitionOutcome {
        let from = record.call_state;

        if from == CallState::Disconnected && to == CallState::Disconnected {
            debug!(call_id = %record.call_id, "Call already disconnected");
            return TransitionOutcome::NoOp;
        }
        if !from.can_transition_to(to) {
            warn!(call_id = %record.call_id, from = %from, to = %to, "Rejected call state transition");
            return TransitionOutcome::Rejected { from, to };
        }

        record.call_state = to;
        match to {
            CallState::Connected => {
                record.connected_time.get_or_insert(at);
            }
            CallState::Disconnected => {
                record.end_time = Some(at);
            }
            _ => {}
        }
        debug!(call_id = %record.call_id, from = %from, to = %to, "Call state transition");
        TransitionOutcome::Applied { from, to }
    }

    /// Apply `to` now; `false` when the transition was rejected
    pub fn try_transition(record: &mut CallRecord, to: CallState) -> bool {
        !matches!(Self::apply(record, to, Utc::now()), TransitionOutcome::Rejected { .. })
    }
}
