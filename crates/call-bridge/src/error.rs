//! Error types for the bridging engine
//!
//! [`AccountingError`] describes failures of the external accounting system and
//! is what the circuit breaker counts. [`BridgeError`] is the crate-wide error
//! returned by the processor, the directory, and configuration loading.

use std::time::Duration;

use callbridge_infra_common::Retryable;
use callbridge_transport::TransportError;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures reported by (or on the way to) the accounting system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountingError {
    /// The system is not running or refused the connection
    #[error("Accounting system unreachable: {reason}")]
    Unreachable { reason: String },

    /// No answer within the allowed time
    #[error("Accounting system did not answer within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The system answered but refused the request
    #[error("Accounting system rejected the request: {reason}")]
    Rejected { reason: String },

    /// The answer could not be interpreted
    #[error("Malformed response from accounting system: {details}")]
    MalformedResponse { details: String },
}

impl AccountingError {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable { reason: reason.into() }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    /// Whether repeating the request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::MalformedResponse { .. } => true,
            Self::Rejected { .. } => false,
        }
    }
}

impl Retryable for AccountingError {
    fn is_transient(&self) -> bool {
        AccountingError::is_transient(self)
    }

    fn category(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::MalformedResponse { .. } => "malformed_response",
        }
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A transport rejected or could not deliver a command
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The accounting system failed an attempted operation
    #[error("Accounting error: {0}")]
    Accounting(#[from] AccountingError),

    /// The circuit breaker short-circuited the operation
    #[error("Circuit open, skipped '{operation}'")]
    CircuitOpen { operation: String },

    /// Configuration is unusable
    #[error("Invalid configuration: {details}")]
    InvalidConfiguration { details: String },

    /// A dial destination normalized to nothing
    #[error("Invalid destination number: '{number}'")]
    InvalidDestination { number: String },

    /// No registered transport is currently connected
    #[error("No connected transport")]
    NoActiveTransport,

    /// No live call or pending dial carries this sync id
    #[error("Unknown sync id: {sync_id}")]
    UnknownSyncId { sync_id: String },

    /// Directory reload requested without a contact source
    #[error("No contact source configured")]
    NoContactSource,

    /// The external call history store failed
    #[error("Call history store failed: {reason}")]
    History { reason: String },

    /// I/O error while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

impl BridgeError {
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfiguration { details: details.into() }
    }

    pub fn history(reason: impl Into<String>) -> Self {
        Self::History { reason: reason.into() }
    }

    /// Whether the retry policy may try again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => Retryable::is_transient(e),
            Self::Accounting(e) => e.is_transient(),
            Self::Io(_) => true,
            Self::CircuitOpen { .. }
            | Self::InvalidConfiguration { .. }
            | Self::InvalidDestination { .. }
            | Self::NoActiveTransport
            | Self::UnknownSyncId { .. }
            | Self::NoContactSource
            | Self::History { .. }
            | Self::ShuttingDown => false,
        }
    }

    /// Short label for structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) | Self::NoActiveTransport => "transport",
            Self::Accounting(_) | Self::CircuitOpen { .. } => "accounting",
            Self::InvalidConfiguration { .. } | Self::NoContactSource | Self::Io(_) => "configuration",
            Self::InvalidDestination { .. } | Self::UnknownSyncId { .. } => "command",
            Self::History { .. } => "history",
            Self::ShuttingDown => "shutdown",
        }
    }
}

impl Retryable for BridgeError {
    fn is_transient(&self) -> bool {
        BridgeError::is_transient(self)
    }

    fn category(&self) -> &'static str {
        BridgeError::category(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting_classification() {
        assert!(AccountingError::unreachable("not running").is_transient());
        assert!(AccountingError::Timeout { timeout: Duration::from_secs(2) }.is_transient());
        assert!(AccountingError::MalformedResponse { details: "truncated".into() }.is_transient());
        assert!(!AccountingError::rejected("unknown call").is_transient());
    }

    #[test]
    fn test_bridge_error_classification() {
        let transport = BridgeError::from(TransportError::Timeout(Duration::from_secs(1)));
        assert!(transport.is_transient());
        assert_eq!(transport.category(), "transport");

        let config = BridgeError::invalid_config("threshold must be positive");
        assert!(!config.is_transient());
        assert_eq!(config.category(), "configuration");

        let open = BridgeError::CircuitOpen { operation: "new_call".into() };
        assert!(!open.is_transient());

        let history = BridgeError::history("disk full");
        assert_eq!(history.category(), "history");
        assert_eq!(history.to_string(), "Call history store failed: disk full");
    }
}
