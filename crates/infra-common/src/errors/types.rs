use thiserror::Error as ThisError;

/// Result alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared infrastructure
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A global subscriber was already installed
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),
}
