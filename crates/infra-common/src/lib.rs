//! Common infrastructure for the callbridge stack
//!
//! Shared by the transport and core crates:
//!
//! - [`logging`]: tracing subscriber setup
//! - [`retry`]: bounded exponential-backoff retry policy and the [`retry::Retryable`]
//!   classification trait
//! - [`errors`]: the infrastructure error type

pub mod errors;
pub mod logging;
pub mod retry;

pub use errors::types::{Error, Result};
pub use logging::setup::{parse_log_level, setup_logging, try_setup_logging, LoggingConfig};
pub use retry::{retry_with_backoff, RetryConfig, Retryable};
