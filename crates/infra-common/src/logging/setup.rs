//! Subscriber installation
//!
//! ```rust,no_run
//! # use callbridge_infra_common::logging::{setup_logging, LoggingConfig};
//! # use tracing::Level;
//! let config = LoggingConfig::new(Level::DEBUG, "callbridge")
//!     .with_json()
//!     .with_directive("callbridge_transport=trace");
//! setup_logging(config).expect("logging");
//! ```

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::types::{Error, Result};

/// How the bridge process writes its log
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default verbosity, added on top of `RUST_LOG`
    pub level: Level,
    /// One JSON object per line instead of human-readable text
    pub json: bool,
    /// Source file and line of every record
    pub file_info: bool,
    /// Span enter/exit records
    pub log_spans: bool,
    /// Name announced in the startup record
    pub app_name: String,
    /// Extra per-target directives such as `callbridge_transport=trace`
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO, "callbridge")
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        Self {
            level,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: app_name.into(),
            directives: Vec::new(),
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Raise or lower one target, e.g. `with_directive("callbridge_core::resilience=debug")`
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// `RUST_LOG`, then the configured level, then the per-target directives
    pub fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(LevelFilter::from_level(self.level).into());
        for raw in &self.directives {
            let directive = Directive::from_str(raw)
                .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", raw, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber
///
/// Fails with [`Error::LoggingInit`] when another subscriber is already in place.
pub fn try_setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let span_events = match config.log_spans {
        true => FmtSpan::NEW | FmtSpan::CLOSE,
        false => FmtSpan::NONE,
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match config.json {
        true => builder.json().with_writer(std::io::stdout).try_init(),
        false => builder.try_init(),
    };
    installed.map_err(|e| Error::LoggingInit(e.to_string()))?;

    tracing::info!(app = %config.app_name, version = env!("CARGO_PKG_VERSION"), json = config.json, "Logging started");
    Ok(())
}

/// Like [`try_setup_logging`], but keeps an already installed subscriber
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    match try_setup_logging(&config) {
        Err(Error::LoggingInit(reason)) => {
            tracing::debug!(reason = %reason, "Keeping the existing subscriber");
            Ok(())
        }
        other => other,
    }
}

/// Accepts `trace`, `debug`, `info`, `warn` and `error` in any case
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}
