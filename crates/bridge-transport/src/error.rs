//! Transport errors
//!
//! Every error knows its [`ErrorCategory`], which is all the reconnect loop
//! looks at:
//!
//! ```rust
//! # use callbridge_transport::{Error, ErrorCategory};
//! # use std::time::Duration;
//! assert_eq!(Error::Timeout(Duration::from_secs(3)).category(), ErrorCategory::Transient);
//! assert_eq!(Error::Protocol("bad frame".into()).category(), ErrorCategory::ConnectionClosed);
//! ```

use std::io;
use std::time::Duration;

use callbridge_infra_common::Retryable;
use thiserror::Error as ThisError;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// How the owning reconnect loop should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Retry with capped backoff
    Transient,
    /// The link went away; reconnect and surface a disconnect
    ConnectionClosed,
    /// Stop quietly
    SystemShuttingDown,
    /// Log and abandon the transport for this session
    Permanent,
}

/// Errors that can occur in the transport layer
#[derive(Debug, ThisError)]
pub enum Error {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Framing or message-level violation; the connection is dropped
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command issued while no connection is up
    #[error("Transport not connected")]
    NotConnected,

    /// Transport is shutting down
    #[error("Transport is shutting down")]
    ShuttingDown,

    /// Command not answered in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Peer answered a command with an error
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// Line driver reported a failure it may recover from
    #[error("Driver error: {0}")]
    Driver(String),

    /// Transport cannot work in this environment (no device, unsupported platform)
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Unsupported peer protocol version
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// Invalid transport configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Categorize the error for the reconnect loop
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(e) => match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof => ErrorCategory::ConnectionClosed,
                io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => {
                    ErrorCategory::Permanent
                }
                _ => ErrorCategory::Transient,
            },
            Error::ConnectionClosed(_) | Error::Protocol(_) | Error::UnsupportedVersion(_) => {
                ErrorCategory::ConnectionClosed
            }
            Error::NotConnected | Error::Timeout(_) | Error::Driver(_) => ErrorCategory::Transient,
            Error::ShuttingDown => ErrorCategory::SystemShuttingDown,
            Error::Rejected(_) | Error::Unavailable(_) | Error::Config(_) => {
                ErrorCategory::Permanent
            }
        }
    }
}

impl Retryable for Error {
    fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    fn category(&self) -> &'static str {
        match Error::category(self) {
            ErrorCategory::Transient => "transient",
            ErrorCategory::ConnectionClosed => "connection_closed",
            ErrorCategory::SystemShuttingDown => "shutting_down",
            ErrorCategory::Permanent => "permanent",
        }
    }
}
