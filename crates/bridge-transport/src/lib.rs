//! Call-event transports for the callbridge stack
//!
//! Three unrelated event sources report call activity from the telephone
//! switch:
//!
//! - [`transport::line`]: a line-monitoring driver behind the [`LineDevice`] trait
//! - [`transport::pipe`]: a local IPC pipe with length-prefixed UTF-16 frames
//! - [`transport::socket`]: phones connecting over TCP with JSON lines
//!
//! Each implements [`TransportProvider`], translates its own representation into
//! a [`CallEvent`], and runs its own reconnect loop driven by [`ErrorCategory`].

pub mod error;
pub mod event;
pub mod transport;

pub use error::{Error, ErrorCategory, Result};
pub use event::{CallDirection, CallEvent, StateTag, TransportEvent, TransportKind};
pub use transport::line::{
    LineCallInfo, LineCallOrigin, LineCallState, LineDevice, LineMonitorConfig, LineMonitorTransport, LineTranslator,
};
pub use transport::pipe::{LocalPipeConfig, LocalPipeTransport, PipeConnector, PipeStream};
pub use transport::socket::{SocketConfig, SocketTransport};
pub use transport::{RequestHandle, TransportProvider};

/// Alias used by downstream crates to keep the two error types apart
pub type TransportError = Error;

pub mod prelude {
    pub use crate::error::{Error as TransportError, ErrorCategory};
    pub use crate::event::{CallDirection, CallEvent, StateTag, TransportEvent, TransportKind};
    pub use crate::transport::{RequestHandle, TransportProvider};
    pub use crate::{LineMonitorTransport, LocalPipeTransport, SocketTransport};
}
