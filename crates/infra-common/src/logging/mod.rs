pub mod setup;

pub use setup::{parse_log_level, setup_logging, try_setup_logging, LoggingConfig};
