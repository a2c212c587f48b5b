//! Resilience gateway
//!
//! Every call to the accounting system passes through [`ResilienceGateway`]:
//!
//! - the [`CircuitBreaker`] decides whether the call is attempted at all;
//! - an attempted call gets at most the configured call timeout, and running
//!   out of time counts as a failure like any other;
//! - failures are logged with their category and handed back to the caller,
//!   which never lets them stop the local call lifecycle.
//!
//! The reachability probe is reported separately and never moves the breaker.
//!
//! # Examples
//!
//! ```rust,ignore
//! let gateway = ResilienceGateway::new(accounting, 3, Duration::from_secs(30))
//!     .with_call_timeout(Duration::from_secs(5));
//!
//! match gateway.new_call(&call).await {
//!     Ok(()) => {}
//!     Err(BridgeError::CircuitOpen { .. }) => { /* skipped, nothing was sent */ }
//!     Err(e) => tracing::debug!(error = %e, "not delivered"),
//! }
//! ```

mod breaker;

pub use breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerState, CircuitStatus};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use callbridge_infra_common::Retryable;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::accounting::{AccountingSystem, CallData};
use crate::error::{AccountingError, BridgeError, Result};
use crate::state::CallState;

/// Default limit for a single accounting call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ResilienceGateway {
    accounting: Arc<dyn AccountingSystem>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    last_probe: Mutex<Option<bool>>,
}

impl ResilienceGateway {
    /// `threshold` consecutive failures open the circuit for `open_timeout`
    pub fn new(accounting: Arc<dyn AccountingSystem>, threshold: u32, open_timeout: Duration) -> Self {
        Self {
            accounting,
            breaker: CircuitBreaker::new("accounting", threshold, open_timeout),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            last_probe: Mutex::new(None),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn accounting(&self) -> &Arc<dyn AccountingSystem> {
        &self.accounting
    }

    /// Run one accounting operation under the breaker and the call timeout
    ///
    /// `operation` is not polled at all while the circuit is open. An operation
    /// still pending after the call timeout is dropped and reported as
    /// [`AccountingError::Timeout`].
    pub async fn execute<T, Fut>(&self, name: &str, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, AccountingError>>,
    {
        let Some(permit) = self.breaker.try_acquire() else {
            debug!(operation = name, "Circuit open, skipping accounting call");
            return Err(BridgeError::CircuitOpen {
                operation: name.to_string(),
            });
        };

        let outcome = match tokio::time::timeout(self.call_timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AccountingError::Timeout {
                timeout: self.call_timeout,
            }),
        };

        match outcome {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                warn!(operation = name, error = %e, category = e.category(), "Accounting call failed");
                Err(BridgeError::Accounting(e))
            }
        }
    }

    pub async fn new_call(&self, call: &CallData) -> Result<()> {
        self.execute("new_call", self.accounting.new_call(call)).await
    }

    pub async fn call_state_changed(&self, call: &CallData, state: CallState) -> Result<()> {
        self.execute("call_state_changed", self.accounting.call_state_changed(call, state))
            .await
    }

    pub async fn contact_assignment_changed(&self, call: &CallData) -> Result<()> {
        self.execute(
            "contact_assignment_changed",
            self.accounting.contact_assignment_changed(call),
        )
        .await
    }

    pub async fn new_journal_entry(&self, call: &CallData, note: &str) -> Result<()> {
        self.execute("new_journal_entry", self.accounting.new_journal_entry(call, note))
            .await
    }

    /// Ask whether the accounting system is reachable; logged on change only
    ///
    /// A probe that outlives the call timeout reads as unreachable.
    pub async fn probe(&self) -> bool {
        let reachable = tokio::time::timeout(self.call_timeout, self.accounting.is_reachable())
            .await
            .unwrap_or(false);
        let previous = self.last_probe.lock().replace(reachable);
        if previous != Some(reachable) {
            if reachable {
                info!("Accounting system reachable");
            } else {
                warn!("Accounting system not reachable");
            }
        }
        reachable
    }
}
