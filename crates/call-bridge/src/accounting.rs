//! Interfaces of the external collaborators
//!
//! The engine talks to the accounting system only through [`AccountingSystem`]
//! (four notifications plus a reachability probe) and receives its commands as
//! [`AccountingCommand`]s. Contacts come from a [`ContactSource`], finished
//! calls go to a [`CallHistoryStore`], and ambiguous matches are resolved by a
//! [`ContactChooser`].

use async_trait::async_trait;
use callbridge_transport::{CallDirection, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::{Contact, ContactMatch};
use crate::error::{AccountingError, BridgeError};
use crate::registry::CallRecord;
use crate::state::CallState;

/// Snapshot of a call as sent to the accounting system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallData {
    pub call_id: String,
    pub transport: TransportKind,
    pub direction: CallDirection,
    pub remote_number: String,
    pub remote_name: Option<String>,
    pub local_extension: Option<String>,
    pub start_time: DateTime<Utc>,
    pub connected_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: CallState,
    pub contact_id: Option<String>,
    pub contact_name: Option<String>,
    pub sync_id: Option<String>,
    pub duration_secs: Option<i64>,
}

impl From<&CallRecord> for CallData {
    fn from(record: &CallRecord) -> Self {
        Self {
            call_id: record.call_id.to_string(),
            transport: record.transport,
            direction: record.direction,
            remote_number: record.remote_number.clone(),
            remote_name: record.remote_name.clone(),
            local_extension: record.local_extension.clone(),
            start_time: record.start_time,
            connected_time: record.connected_time,
            end_time: record.end_time,
            state: record.state(),
            contact_id: record.resolved_contact.as_ref().map(|m| m.contact_id().to_string()),
            contact_name: record.resolved_contact.as_ref().map(|m| m.contact_name().to_string()),
            sync_id: record.sync_id.clone(),
            duration_secs: record.duration().map(|d| d.num_seconds()),
        }
    }
}

/// Notification side of the accounting system
#[async_trait]
pub trait AccountingSystem: Send + Sync {
    /// Cheap check whether the system is running; never counted as a failure
    async fn is_reachable(&self) -> bool;

    async fn new_call(&self, call: &CallData) -> Result<(), AccountingError>;

    async fn call_state_changed(&self, call: &CallData, new_state: CallState) -> Result<(), AccountingError>;

    async fn contact_assignment_changed(&self, call: &CallData) -> Result<(), AccountingError>;

    async fn new_journal_entry(&self, call: &CallData, note: &str) -> Result<(), AccountingError>;
}

/// Commands issued by the accounting system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AccountingCommand {
    Dial {
        number: String,
        sync_id: String,
        contact_hint: Option<String>,
    },
    Drop {
        sync_id: String,
    },
}

/// The accounting system's directory service
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn load_contacts(&self) -> Result<Vec<Contact>, AccountingError>;
}

/// Receives every finished call
#[async_trait]
pub trait CallHistoryStore: Send + Sync {
    async fn append(&self, record: CallRecord) -> Result<(), BridgeError>;
}

/// Presents candidate contacts and returns the chosen contact id
///
/// `None` means the choice was dismissed.
#[async_trait]
pub trait ContactChooser: Send + Sync {
    async fn choose(&self, call: &CallData, candidates: &[ContactMatch]) -> Option<String>;
}
