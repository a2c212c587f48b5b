//! Bridge configuration
//!
//! Every section has serde defaults, so a configuration file only needs the
//! values it changes:
//!
//! ```toml
//! local_extension = "21"
//!
//! [routing]
//! window_secs = 900
//!
//! [resilience]
//! failure_threshold = 5
//! ```

use std::path::Path;
use std::time::Duration;

use callbridge_infra_common::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::directory::MIN_SUFFIX_MATCH_LENGTH;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Trailing digits compared when matching numbers; `0` compares whole numbers
    pub comparison_length: usize,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self { comparison_length: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// How long a chosen contact stays preferred; `0` disables routing
    pub window_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { window_secs: 600 }
    }
}

impl RoutingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisambiguationConfig {
    pub enabled: bool,
    /// Pause after connect before the candidates are presented
    pub delay_ms: u64,
}

impl Default for DisambiguationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 1_500,
        }
    }
}

impl DisambiguationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call
    pub open_timeout_secs: u64,
    /// Longest wait for one accounting call or history write; a timeout counts as a failure
    pub call_timeout_ms: u64,
    /// Reachability check of the accounting system; `None` disables it
    pub probe_interval_secs: Option<u64>,
    /// Retry policy for directory loading
    pub retry: RetryConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_secs: 30,
            call_timeout_ms: 5_000,
            probe_interval_secs: Some(30),
            retry: RetryConfig::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Calls without activity for this long are swept
    pub stale_call_timeout_secs: u64,
    /// Unmatched dial requests are discarded after this long
    pub pending_dial_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_call_timeout_secs: 4 * 60 * 60,
            pending_dial_timeout_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn stale_call_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_call_timeout_secs)
    }

    pub fn pending_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_dial_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Periodic reload from the contact source
    pub reload_interval_secs: Option<u64>,
}

impl DirectoryConfig {
    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Send a journal entry when a call finishes
    pub enabled: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub phone: PhoneConfig,
    pub routing: RoutingConfig,
    pub disambiguation: DisambiguationConfig,
    pub resilience: ResilienceConfig,
    pub registry: RegistryConfig,
    pub directory: DirectoryConfig,
    pub journal: JournalConfig,
    /// Extension recorded for calls whose transport reports none
    pub local_extension: Option<String>,
}

impl BridgeConfig {
    /// Load from a `.json` or `.toml` file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config: BridgeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| BridgeError::invalid_config(format!("{}: {}", path.display(), e)))?,
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| BridgeError::invalid_config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(BridgeError::invalid_config(format!(
                    "unsupported configuration format: {}",
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let length = self.phone.comparison_length;
        if length != 0 && length < MIN_SUFFIX_MATCH_LENGTH {
            return Err(BridgeError::invalid_config(format!(
                "phone.comparison_length must be 0 or at least {}",
                MIN_SUFFIX_MATCH_LENGTH
            )));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(BridgeError::invalid_config("resilience.failure_threshold must be positive"));
        }
        if self.resilience.open_timeout_secs == 0 {
            return Err(BridgeError::invalid_config("resilience.open_timeout_secs must be positive"));
        }
        if self.resilience.call_timeout_ms == 0 {
            return Err(BridgeError::invalid_config("resilience.call_timeout_ms must be positive"));
        }
        if self.resilience.probe_interval_secs == Some(0) {
            return Err(BridgeError::invalid_config("resilience.probe_interval_secs must be positive"));
        }
        if self.resilience.retry.base_delay_ms > self.resilience.retry.max_delay_ms {
            return Err(BridgeError::invalid_config("resilience.retry.base_delay_ms exceeds max_delay_ms"));
        }
        if self.registry.sweep_interval_secs == 0 {
            return Err(BridgeError::invalid_config("registry.sweep_interval_secs must be positive"));
        }
        if self.registry.pending_dial_timeout_secs >= self.registry.stale_call_timeout_secs {
            return Err(BridgeError::invalid_config(
                "registry.pending_dial_timeout_secs must be shorter than stale_call_timeout_secs",
            ));
        }
        if self.directory.reload_interval_secs == Some(0) {
            return Err(BridgeError::invalid_config("directory.reload_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn with_comparison_length(mut self, length: usize) -> Self {
        self.phone.comparison_length = length;
        self
    }

    pub fn with_routing_window(mut self, window: Duration) -> Self {
        self.routing.window_secs = window.as_secs();
        self
    }

    pub fn with_disambiguation_delay(mut self, delay: Duration) -> Self {
        self.disambiguation.enabled = true;
        self.disambiguation.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn without_disambiguation(mut self) -> Self {
        self.disambiguation.enabled = false;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.resilience.failure_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.resilience.open_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.resilience.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.resilience.probe_interval_secs = Some(interval.as_secs());
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.resilience.probe_interval_secs = None;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.resilience.retry = retry;
        self
    }

    pub fn with_stale_call_timeout(mut self, timeout: Duration) -> Self {
        self.registry.stale_call_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_pending_dial_timeout(mut self, timeout: Duration) -> Self {
        self.registry.pending_dial_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.registry.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn with_directory_reload_interval(mut self, interval: Duration) -> Self {
        self.directory.reload_interval_secs = Some(interval.as_secs());
        self
    }

    pub fn with_journal(mut self, enabled: bool) -> Self {
        self.journal.enabled = enabled;
        self
    }

    pub fn with_local_extension(mut self, extension: impl Into<String>) -> Self {
        self.local_extension = Some(extension.into());
        self
    }
}
