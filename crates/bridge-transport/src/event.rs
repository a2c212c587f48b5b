//! Normalized call events
//!
//! Every transport translates its own wire or driver representation into
//! [`CallEvent`] before anything else sees it. Nothing downstream knows which
//! transport produced an event except through [`CallEvent::transport`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The three event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Line-monitoring driver (TAPI style)
    LineMonitor,
    /// Local IPC pipe to a telephony server
    LocalPipe,
    /// Phones/softphones connecting over TCP
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LineMonitor => "line",
            TransportKind::LocalPipe => "pipe",
            TransportKind::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Inbound => f.write_str("in"),
            CallDirection::Outbound => f.write_str("out"),
        }
    }
}

impl FromStr for CallDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "inbound" | "incoming" => Ok(CallDirection::Inbound),
            "out" | "outbound" | "outgoing" => Ok(CallDirection::Outbound),
            other => Err(Error::Protocol(format!("unknown call direction '{}'", other))),
        }
    }
}

/// Transport-reported call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTag {
    Offered,
    Dialing,
    Ringback,
    Accepted,
    Connected,
    Ended,
}

impl StateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateTag::Offered => "offered",
            StateTag::Dialing => "dialing",
            StateTag::Ringback => "ringback",
            StateTag::Accepted => "accepted",
            StateTag::Connected => "connected",
            StateTag::Ended => "ended",
        }
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offered" | "offering" | "ringing" | "alerting" => Ok(StateTag::Offered),
            "dialing" | "dialtone" | "proceeding" => Ok(StateTag::Dialing),
            "ringback" => Ok(StateTag::Ringback),
            "accepted" => Ok(StateTag::Accepted),
            "connected" => Ok(StateTag::Connected),
            "ended" | "disconnected" | "idle" | "busy" => Ok(StateTag::Ended),
            other => Err(Error::Protocol(format!("unknown call state '{}'", other))),
        }
    }
}

/// Transport-agnostic call event, immutable once emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub transport: TransportKind,
    pub transport_call_id: String,
    pub direction: CallDirection,
    pub raw_remote_number: String,
    pub raw_remote_name: Option<String>,
    pub raw_called_number: Option<String>,
    pub state: StateTag,
    pub extension_hint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CallEvent {
    pub fn new(
        transport: TransportKind,
        transport_call_id: impl Into<String>,
        direction: CallDirection,
        state: StateTag,
    ) -> Self {
        Self {
            transport,
            transport_call_id: transport_call_id.into(),
            direction,
            raw_remote_number: String::new(),
            raw_remote_name: None,
            raw_called_number: None,
            state,
            extension_hint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_remote_number(mut self, number: impl Into<String>) -> Self {
        self.raw_remote_number = number.into();
        self
    }

    pub fn with_remote_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.raw_remote_name = if name.trim().is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_called_number(mut self, number: impl Into<String>) -> Self {
        self.raw_called_number = Some(number.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        self.extension_hint = if extension.trim().is_empty() { None } else { Some(extension) };
        self
    }
}

/// Everything a transport reports to its consumer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A normalized call event
    Call(CallEvent),
    /// The transport (re)established its link
    Connected { transport: TransportKind },
    /// The link dropped; the transport will try to reconnect
    Disconnected { transport: TransportKind, reason: String },
    /// The transport gave up for this session
    Failed { transport: TransportKind, error: String },
}

impl TransportEvent {
    pub fn transport(&self) -> TransportKind {
        match self {
            TransportEvent::Call(event) => event.transport,
            TransportEvent::Connected { transport }
            | TransportEvent::Disconnected { transport, .. }
            | TransportEvent::Failed { transport, .. } => *transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tag_aliases() {
        assert_eq!("OFFERED".parse::<StateTag>().unwrap(), StateTag::Offered);
        assert_eq!("proceeding".parse::<StateTag>().unwrap(), StateTag::Dialing);
        assert_eq!("Disconnected".parse::<StateTag>().unwrap(), StateTag::Ended);
        assert!("on-hold".parse::<StateTag>().is_err());
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("IN".parse::<CallDirection>().unwrap(), CallDirection::Inbound);
        assert_eq!("outgoing".parse::<CallDirection>().unwrap(), CallDirection::Outbound);
        assert!("sideways".parse::<CallDirection>().is_err());
    }

    #[test]
    fn test_blank_optional_fields_are_dropped() {
        let event = CallEvent::new(TransportKind::Socket, "7", CallDirection::Inbound, StateTag::Offered)
            .with_remote_name("  ")
            .with_extension("");
        assert!(event.raw_remote_name.is_none());
        assert!(event.extension_hint.is_none());
    }
}
