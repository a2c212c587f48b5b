//! Line-monitor transport
//!
//! Wraps a [`LineDevice`], the narrow interface over the platform's
//! line-monitoring driver. The driver reports fine-grained call states; this
//! module folds them into [`StateTag`]s and picks the remote party by call origin.
//!
//! Several driver states end a call (busy, disconnected, idle) and a normal
//! teardown reports more than one of them. [`LineTranslator`] passes on only the
//! first, so a finished call is not reported as ending twice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use callbridge_infra_common::RetryConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::event::{CallDirection, CallEvent, StateTag, TransportEvent, TransportKind};
use crate::transport::{deliver, run_with_reconnect, RequestHandle, TransportProvider};

/// Call states as reported by the line driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineCallState {
    Idle,
    Offering,
    Accepted,
    Dialtone,
    Dialing,
    Proceeding,
    Ringback,
    Busy,
    Connected,
    Disconnected,
    Unknown,
}

impl LineCallState {
    /// Fold a driver state into a normalized tag; `None` means "ignore"
    pub fn to_state_tag(self) -> Option<StateTag> {
        match self {
            LineCallState::Offering => Some(StateTag::Offered),
            LineCallState::Accepted => Some(StateTag::Accepted),
            LineCallState::Dialtone | LineCallState::Dialing | LineCallState::Proceeding => {
                Some(StateTag::Dialing)
            }
            LineCallState::Ringback => Some(StateTag::Ringback),
            LineCallState::Connected => Some(StateTag::Connected),
            LineCallState::Busy | LineCallState::Disconnected | LineCallState::Idle => {
                Some(StateTag::Ended)
            }
            LineCallState::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCallOrigin {
    Inbound,
    Outbound,
}

/// One call-state notification from the driver
#[derive(Debug, Clone)]
pub struct LineCallInfo {
    pub call_handle: String,
    pub origin: LineCallOrigin,
    pub state: LineCallState,
    pub caller_id: Option<String>,
    pub caller_name: Option<String>,
    pub called_id: Option<String>,
    pub called_name: Option<String>,
    pub line_extension: Option<String>,
}

/// Narrow interface over the line-monitoring driver
#[async_trait]
pub trait LineDevice: Send + Sync {
    /// Open the monitored line
    async fn open(&self) -> Result<()>;

    /// Wait for the next call-state notification
    async fn next_event(&self) -> Result<LineCallInfo>;

    /// Place a call; returns the driver's call handle
    async fn make_call(&self, destination: &str) -> Result<String>;

    async fn drop_call(&self, call_handle: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineMonitorConfig {
    /// Only report calls on this extension
    pub line_extension: Option<String>,
    pub reconnect: RetryConfig,
}

impl Default for LineMonitorConfig {
    fn default() -> Self {
        Self {
            line_extension: None,
            reconnect: RetryConfig::slow(),
        }
    }
}

pub struct LineMonitorTransport {
    device: Arc<dyn LineDevice>,
    config: LineMonitorConfig,
    connected: Arc<AtomicBool>,
    token: CancellationToken,
    started: Mutex<bool>,
}

impl LineMonitorTransport {
    pub fn new(device: Arc<dyn LineDevice>, config: LineMonitorConfig) -> Self {
        Self {
            device,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
            started: Mutex::new(false),
        }
    }

    /// Translate a driver notification, applying the extension filter
    pub fn translate(info: &LineCallInfo, filter: Option<&str>) -> Option<CallEvent> {
        if let (Some(wanted), Some(actual)) = (filter, info.line_extension.as_deref()) {
            if wanted != actual {
                trace!(call_handle = %info.call_handle, line = actual, "Ignoring call on other line");
                return None;
            }
        }

        let state = info.state.to_state_tag()?;
        let (direction, number, name) = match info.origin {
            LineCallOrigin::Inbound => (CallDirection::Inbound, &info.caller_id, &info.caller_name),
            LineCallOrigin::Outbound => (CallDirection::Outbound, &info.called_id, &info.called_name),
        };

        let mut event = CallEvent::new(TransportKind::LineMonitor, info.call_handle.clone(), direction, state)
            .with_remote_number(number.clone().unwrap_or_default());
        if let Some(name) = name {
            event = event.with_remote_name(name.clone());
        }
        if let Some(called) = &info.called_id {
            event = event.with_called_number(called.clone());
        }
        if let Some(extension) = &info.line_extension {
            event = event.with_extension(extension.clone());
        }
        Some(event)
    }
}

/// Stateful translation for one line session
///
/// # Examples
///
/// ```
/// use callbridge_transport::{LineCallInfo, LineCallOrigin, LineCallState, LineTranslator};
///
/// let mut translator = LineTranslator::new(None);
/// let mut info = LineCallInfo {
///     call_handle: "0x2a".into(),
///     origin: LineCallOrigin::Inbound,
///     state: LineCallState::Disconnected,
///     caller_id: Some("0891112222".into()),
///     caller_name: None,
///     called_id: None,
///     called_name: None,
///     line_extension: None,
/// };
/// assert!(translator.translate(&info).is_some());
///
/// info.state = LineCallState::Idle;
/// assert!(translator.translate(&info).is_none());
/// ```
#[derive(Debug, Default)]
pub struct LineTranslator {
    filter: Option<String>,
    /// Calls already reported as ended, until the driver releases them with idle
    ended: HashSet<String>,
}

impl LineTranslator {
    pub fn new(filter: Option<String>) -> Self {
        Self {
            filter,
            ended: HashSet::new(),
        }
    }

    pub fn translate(&mut self, info: &LineCallInfo) -> Option<CallEvent> {
        let event = LineMonitorTransport::translate(info, self.filter.as_deref())?;
        if event.state != StateTag::Ended {
            self.ended.remove(&info.call_handle);
            return Some(event);
        }

        let first_end = self.ended.insert(info.call_handle.clone());
        if info.state == LineCallState::Idle {
            self.ended.remove(&info.call_handle);
        }
        if !first_end {
            trace!(call_handle = %info.call_handle, state = ?info.state, "Call already reported as ended");
            return None;
        }
        Some(event)
    }
}

async fn run_line_session(
    device: Arc<dyn LineDevice>,
    filter: Option<String>,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    device.open().await?;
    connected.store(true, Ordering::SeqCst);
    info!(line = ?filter, "Line device opened");
    deliver(&events, TransportEvent::Connected { transport: TransportKind::LineMonitor }).await?;

    let mut translator = LineTranslator::new(filter);
    let result = async {
        loop {
            let info = device.next_event().await?;
            debug!(call_handle = %info.call_handle, state = ?info.state, "Line call state");
            if let Some(event) = translator.translate(&info) {
                deliver(&events, TransportEvent::Call(event)).await?;
            }
        }
    }
    .await;

    connected.store(false, Ordering::SeqCst);
    let _ = device.close().await;
    result
}

#[async_trait]
impl TransportProvider for LineMonitorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LineMonitor
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::Config("line monitor transport already started".into()));
            }
            *started = true;
        }

        let device = self.device.clone();
        let filter = self.config.line_extension.clone();
        let connected = self.connected.clone();
        let policy = self.config.reconnect.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let loop_events = events.clone();
            run_with_reconnect(TransportKind::LineMonitor, policy, token, loop_events, || {
                run_line_session(device.clone(), filter.clone(), connected.clone(), events.clone())
            })
            .await;
            connected.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn make_call(&self, destination: &str) -> Result<RequestHandle> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let handle = self.device.make_call(destination).await?;
        info!(destination = destination, call_handle = %handle, "Line device placing call");
        Ok(RequestHandle(handle))
    }

    async fn drop_call(&self, call_handle: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.device.drop_call(call_handle).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.device.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(origin: LineCallOrigin, state: LineCallState) -> LineCallInfo {
        LineCallInfo {
            call_handle: "0x1f".to_string(),
            origin,
            state,
            caller_id: Some("+49 89 11112222".to_string()),
            caller_name: Some("Alice".to_string()),
            called_id: Some("0891234".to_string()),
            called_name: None,
            line_extension: Some("21".to_string()),
        }
    }

    #[test]
    fn test_inbound_takes_caller_as_remote() {
        let event = LineMonitorTransport::translate(&info(LineCallOrigin::Inbound, LineCallState::Offering), None)
            .expect("event");
        assert_eq!(event.direction, CallDirection::Inbound);
        assert_eq!(event.raw_remote_number, "+49 89 11112222");
        assert_eq!(event.raw_remote_name.as_deref(), Some("Alice"));
        assert_eq!(event.state, StateTag::Offered);
        assert_eq!(event.extension_hint.as_deref(), Some("21"));
    }

    #[test]
    fn test_outbound_takes_called_as_remote() {
        let event = LineMonitorTransport::translate(&info(LineCallOrigin::Outbound, LineCallState::Proceeding), None)
            .expect("event");
        assert_eq!(event.direction, CallDirection::Outbound);
        assert_eq!(event.raw_remote_number, "0891234");
        assert_eq!(event.state, StateTag::Dialing);
    }

    #[test]
    fn test_teardown_reports_one_end() {
        let mut translator = LineTranslator::new(None);
        let states = [
            LineCallState::Offering,
            LineCallState::Connected,
            LineCallState::Disconnected,
            LineCallState::Idle,
        ];
        let tags: Vec<StateTag> = states
            .iter()
            .filter_map(|state| translator.translate(&info(LineCallOrigin::Inbound, *state)))
            .map(|event| event.state)
            .collect();
        assert_eq!(tags, vec![StateTag::Offered, StateTag::Connected, StateTag::Ended]);

        // handle reused by the driver after idle
        let reused = translator.translate(&info(LineCallOrigin::Inbound, LineCallState::Offering));
        assert_eq!(reused.map(|e| e.state), Some(StateTag::Offered));
        let busy = translator.translate(&info(LineCallOrigin::Inbound, LineCallState::Busy));
        assert_eq!(busy.map(|e| e.state), Some(StateTag::Ended));
        assert!(translator.translate(&info(LineCallOrigin::Inbound, LineCallState::Disconnected)).is_none());
    }

    #[test]
    fn test_filter_and_unknown_states_are_dropped() {
        let call = info(LineCallOrigin::Inbound, LineCallState::Connected);
        assert!(LineMonitorTransport::translate(&call, Some("22")).is_none());
        assert!(LineMonitorTransport::translate(&call, Some("21")).is_some());

        let unknown = info(LineCallOrigin::Inbound, LineCallState::Unknown);
        assert!(LineMonitorTransport::translate(&unknown, None).is_none());
    }
}
