//! Test doubles shared by the processor integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use callbridge_core::{
    AccountingError, AccountingSystem, BridgeError, CallData, CallHistoryStore, CallRecord, CallState, Contact,
    ContactChooser, ContactMatch, ContactSource,
};
use callbridge_transport::{
    CallDirection, CallEvent, RequestHandle, StateTag, TransportError, TransportEvent, TransportKind,
    TransportProvider,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewCall {
        call_id: String,
        contact_id: Option<String>,
        sync_id: Option<String>,
    },
    StateChanged {
        call_id: String,
        state: CallState,
    },
    ContactChanged {
        call_id: String,
        contact_id: Option<String>,
    },
    Journal {
        call_id: String,
        note: String,
    },
}

#[derive(Default)]
pub struct MockAccounting {
    attempts: AtomicU32,
    probes: AtomicU32,
    failing: AtomicBool,
    hanging: AtomicBool,
    notifications: Mutex<Vec<Notification>>,
}

impl MockAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        let accounting = Self::default();
        accounting.failing.store(true, Ordering::SeqCst);
        Arc::new(accounting)
    }

    /// Every notification waits forever
    pub fn hanging() -> Arc<Self> {
        let accounting = Self::default();
        accounting.hanging.store(true, Ordering::SeqCst);
        Arc::new(accounting)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn contact_changes(&self) -> usize {
        self.notifications()
            .iter()
            .filter(|n| matches!(n, Notification::ContactChanged { .. }))
            .count()
    }

    async fn deliver(&self, notification: Notification) -> Result<(), AccountingError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AccountingError::unreachable("accounting system not running"));
        }
        self.notifications.lock().push(notification);
        Ok(())
    }
}

#[async_trait]
impl AccountingSystem for MockAccounting {
    async fn is_reachable(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.failing.load(Ordering::SeqCst)
    }

    async fn new_call(&self, call: &CallData) -> Result<(), AccountingError> {
        self.deliver(Notification::NewCall {
            call_id: call.call_id.clone(),
            contact_id: call.contact_id.clone(),
            sync_id: call.sync_id.clone(),
        })
        .await
    }

    async fn call_state_changed(&self, call: &CallData, new_state: CallState) -> Result<(), AccountingError> {
        self.deliver(Notification::StateChanged {
            call_id: call.call_id.clone(),
            state: new_state,
        })
        .await
    }

    async fn contact_assignment_changed(&self, call: &CallData) -> Result<(), AccountingError> {
        self.deliver(Notification::ContactChanged {
            call_id: call.call_id.clone(),
            contact_id: call.contact_id.clone(),
        })
        .await
    }

    async fn new_journal_entry(&self, call: &CallData, note: &str) -> Result<(), AccountingError> {
        self.deliver(Notification::Journal {
            call_id: call.call_id.clone(),
            note: note.to_string(),
        })
        .await
    }
}

/// Always picks the same contact, if it is among the candidates
pub struct FixedChooser {
    choice: Option<String>,
    presented: Mutex<Vec<Vec<String>>>,
}

impl FixedChooser {
    pub fn picking(contact_id: &str) -> Arc<Self> {
        Arc::new(Self {
            choice: Some(contact_id.to_string()),
            presented: Mutex::new(Vec::new()),
        })
    }

    pub fn presentations(&self) -> Vec<Vec<String>> {
        self.presented.lock().clone()
    }
}

#[async_trait]
impl ContactChooser for FixedChooser {
    async fn choose(&self, _call: &CallData, candidates: &[ContactMatch]) -> Option<String> {
        self.presented
            .lock()
            .push(candidates.iter().map(|c| c.contact_id().to_string()).collect());
        self.choice.clone()
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<CallRecord>>,
    failing: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let history = Self::default();
        history.failing.store(true, Ordering::SeqCst);
        Arc::new(history)
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl CallHistoryStore for MemoryHistory {
    async fn append(&self, record: CallRecord) -> Result<(), BridgeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::history("history database locked"));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

pub struct StaticSource {
    contacts: Vec<Contact>,
}

impl StaticSource {
    pub fn new(contacts: Vec<Contact>) -> Arc<Self> {
        Arc::new(Self { contacts })
    }
}

#[async_trait]
impl ContactSource for StaticSource {
    async fn load_contacts(&self) -> Result<Vec<Contact>, AccountingError> {
        Ok(self.contacts.clone())
    }
}

/// Transport driven by the test through its event sender
pub struct MockTransport {
    kind: TransportKind,
    connected: AtomicBool,
    refuse_dial: AtomicBool,
    shut_down: AtomicBool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    dialed: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connected: AtomicBool::new(true),
            refuse_dial: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            events: Mutex::new(None),
            dialed: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn refuse_dials(&self) {
        self.refuse_dial.store(true, Ordering::SeqCst);
    }

    pub fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.events.lock().clone()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        self.events.lock().replace(events);
        Ok(())
    }

    async fn make_call(&self, destination: &str) -> Result<RequestHandle, TransportError> {
        if self.refuse_dial.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("line busy".into()));
        }
        let mut dialed = self.dialed.lock();
        dialed.push(destination.to_string());
        Ok(RequestHandle(format!("req-{}", dialed.len())))
    }

    async fn drop_call(&self, call_handle: &str) -> Result<(), TransportError> {
        self.dropped.lock().push(call_handle.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.events.lock().take();
        Ok(())
    }
}

pub fn inbound(id: &str, number: &str, state: StateTag) -> CallEvent {
    CallEvent::new(TransportKind::Socket, id, CallDirection::Inbound, state).with_remote_number(number)
}

pub fn outbound(id: &str, number: &str, state: StateTag) -> CallEvent {
    CallEvent::new(TransportKind::Socket, id, CallDirection::Outbound, state).with_remote_number(number)
}

/// Poll `condition`, letting the paused clock run between checks
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
