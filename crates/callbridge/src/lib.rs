//! # callbridge
//!
//! Bridges call events from a telephone switch into an accounting system.
//!
//! - [`transport`]: the three event sources (line monitor, local pipe, socket)
//! - [`core`]: normalization, contact resolution, call lifecycle, circuit breaker
//! - [`infra_common`]: logging setup and the retry policy
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use callbridge::prelude::*;
//!
//! setup_logging(LoggingConfig::default())?;
//! let config = BridgeConfig::from_file("callbridge.toml")?;
//! let processor = CallEventProcessor::builder(config, accounting)
//!     .transport(Arc::new(SocketTransport::new(SocketConfig::default())))
//!     .build()?;
//! processor.run().await?;
//! ```

#![warn(rust_2018_idioms)]

pub use callbridge_core as core;
pub use callbridge_infra_common as infra_common;
pub use callbridge_transport as transport;

pub mod prelude {
    //! Common imports for callbridge applications

    pub use crate::core::prelude::*;
    pub use crate::infra_common::{setup_logging, LoggingConfig, RetryConfig};
    pub use crate::transport::{LineMonitorConfig, LocalPipeConfig, SocketConfig};
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
