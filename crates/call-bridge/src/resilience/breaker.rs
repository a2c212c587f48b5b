//! Circuit breaker
//!
//! ```text
//!  Closed --threshold consecutive failures--> Open
//!  Open --open_timeout elapsed, next call--> HalfOpen (one trial)
//!  HalfOpen --trial ok--> Closed
//!  HalfOpen --trial failed--> Open
//! ```
//!
//! Transitions are logged once each; calls rejected while open are only logged
//! at debug level by the caller.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, open_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            open_timeout,
            inner: Mutex::new(Inner {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().status
    }

    /// Ask to make an attempt; `None` means short-circuit
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. Dropping it unresolved frees a half-open
    /// trial slot without counting anything.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.status {
            CircuitStatus::Closed => Some(BreakerPermit::new(self, false)),
            CircuitStatus::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed < self.open_timeout {
                    return None;
                }
                inner.status = CircuitStatus::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "Circuit half-open, allowing one trial call");
                Some(BreakerPermit::new(self, true))
            }
            CircuitStatus::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(BreakerPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.status == CircuitStatus::HalfOpen && trial {
            info!(breaker = %self.name, "Trial call succeeded, circuit closed");
            inner.status = CircuitStatus::Closed;
            inner.opened_at = None;
        }
        inner.consecutive_failures = 0;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.status {
            CircuitStatus::HalfOpen if trial => {
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
                inner.status = CircuitStatus::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitStatus::Closed if inner.consecutive_failures >= self.threshold => {
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    open_for_secs = self.open_timeout.as_secs(),
                    "Circuit opened"
                );
                inner.status = CircuitStatus::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    fn on_abandoned(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.status != CircuitStatus::Closed {
            info!(breaker = %self.name, "Circuit reset");
        }
        inner.status = CircuitStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

/// Permission for one attempt
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.on_abandoned();
        }
    }
}
