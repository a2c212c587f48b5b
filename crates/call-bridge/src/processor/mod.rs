//! Call event processor
//!
//! The orchestrator between transports, the directory and the accounting system.
//! For every [`CallEvent`] it:
//!
//! 1. drops duplicates of the previous state tag for the same call,
//! 2. creates or fetches the [`CallRecord`] and applies the transition,
//! 3. resolves the caller when the call starts (pending dial requests first,
//!    then the directory reordered by the routing cache), or as soon as a
//!    later event supplies a number the first one lacked,
//! 4. schedules disambiguation when an ambiguous call connects,
//! 5. finishes the call on disconnect: notifications, journal, history.
//!
//! Accounting notifications pass through the [`ResilienceGateway`]. Their
//! failure never blocks or reverts the local call lifecycle.
//!
//! # Examples
//!
//! Driving the processor by hand, without [`CallEventProcessor::run`]:
//!
//! ```rust,ignore
//! let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting)
//!     .contact_source(source)
//!     .build()?;
//! processor.reload_directory().await?;
//!
//! let offered = CallEvent::new(TransportKind::Socket, "21/7", CallDirection::Inbound, StateTag::Offered)
//!     .with_remote_number("+49 89 11112222");
//! assert!(matches!(processor.handle_event(offered).await, EventOutcome::Applied { .. }));
//! ```

mod builder;
mod run;
mod stats;

pub use builder::ProcessorBuilder;
pub use stats::ProcessorStats;

use std::sync::Arc;

use callbridge_transport::{CallDirection, CallEvent, RequestHandle, StateTag, TransportKind, TransportProvider};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::stats::{bump, Counters};
use crate::accounting::{AccountingCommand, AccountingSystem, CallData, CallHistoryStore, ContactChooser, ContactSource};
use crate::config::BridgeConfig;
use crate::directory::{ContactDirectory, MIN_SUFFIX_MATCH_LENGTH};
use crate::error::{BridgeError, Result};
use crate::registry::{CallId, CallRecord, CallRegistry, SharedRecord, SweepReport};
use crate::resilience::ResilienceGateway;
use crate::routing::RoutingCache;
use crate::state::{CallState, CallStateMachine, TransitionOutcome};

/// What [`CallEventProcessor::handle_event`] did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Same state tag as the previous event for this call
    Debounced,
    /// Not allowed from the call's current state
    Rejected { from: CallState, to: CallState },
    /// Repeated terminal state
    Ignored,
    Applied { call_id: CallId, state: CallState },
    /// Same state as before, but the event supplied the caller's number
    Updated { call_id: CallId },
}

/// What a drop command affected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// The owning transport was asked to drop the live call
    CallDropped,
    /// No call yet; the pending dial request was withdrawn
    PendingCancelled,
}

/// Result of an [`AccountingCommand`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Dialed(RequestHandle),
    Dropped(DropOutcome),
}

pub(crate) struct Inner {
    config: BridgeConfig,
    directory: ContactDirectory,
    routing: RoutingCache,
    registry: CallRegistry,
    gateway: ResilienceGateway,
    transports: Vec<Arc<dyn TransportProvider>>,
    contact_source: Option<Arc<dyn ContactSource>>,
    history: Option<Arc<dyn CallHistoryStore>>,
    chooser: Option<Arc<dyn ContactChooser>>,
    /// Last state tag seen per call, for debouncing
    last_tags: DashMap<CallId, StateTag>,
    /// Scheduled disambiguations, cancelled on disconnect
    disambiguations: DashMap<CallId, CancellationToken>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones drive the same engine
#[derive(Clone)]
pub struct CallEventProcessor {
    inner: Arc<Inner>,
}

impl CallEventProcessor {
    pub fn builder(config: BridgeConfig, accounting: Arc<dyn AccountingSystem>) -> ProcessorBuilder {
        ProcessorBuilder::new(config, accounting)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &ContactDirectory {
        &self.inner.directory
    }

    pub fn routing(&self) -> &RoutingCache {
        &self.inner.routing
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.inner.registry
    }

    pub fn gateway(&self) -> &ResilienceGateway {
        &self.inner.gateway
    }

    pub fn transports(&self) -> &[Arc<dyn TransportProvider>] {
        &self.inner.transports
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.counters.snapshot()
    }

    /// Token cancelled by [`CallEventProcessor::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop [`CallEventProcessor::run`] and every pending disambiguation
    pub fn shutdown(&self) {
        info!("Call event processor shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Process one normalized event
    ///
    /// Events of one call must be handed in one at a time and in order;
    /// [`CallEventProcessor::run`] takes care of that with one lane per call.
    pub async fn handle_event(&self, event: CallEvent) -> EventOutcome {
        let inner = &self.inner;
        bump(&inner.counters.events_received);

        let call_id = CallId::for_event(&event);
        if inner.last_tags.insert(call_id.clone(), event.state) == Some(event.state) {
            if self.number_supplied_late(&call_id, &event).await {
                return EventOutcome::Updated { call_id };
            }
            bump(&inner.counters.events_debounced);
            debug!(call_id = %call_id, state = %event.state, "Duplicate call event ignored");
            return EventOutcome::Debounced;
        }

        let (record, created) = inner.registry.get_or_create(&call_id, || {
            CallRecord::from_event(call_id.clone(), &event, inner.config.local_extension.clone())
        });

        let (outcome, number_arrived) = {
            let mut call = record.lock();
            let had_number = !call.remote_number.is_empty();
            call.merge_event_details(&event);
            let number_arrived = !created && !had_number && !call.remote_number.is_empty();
            (CallStateMachine::apply(&mut call, event.state.into(), event.timestamp), number_arrived)
        };

        match outcome {
            TransitionOutcome::Rejected { from, to } => {
                bump(&inner.counters.transitions_rejected);
                if created {
                    inner.registry.remove(&call_id);
                    inner.last_tags.remove(&call_id);
                }
                EventOutcome::Rejected { from, to }
            }
            TransitionOutcome::NoOp => EventOutcome::Ignored,
            TransitionOutcome::Applied { from, to } => {
                if number_arrived && from != CallState::Idle {
                    self.on_number_arrived(&call_id, &record).await;
                }
                match to {
                    CallState::Offering | CallState::Dialing if from == CallState::Idle => {
                        self.on_call_started(&call_id, &record).await;
                    }
                    CallState::Connected => self.on_connected(&call_id, &record).await,
                    CallState::Disconnected => self.on_disconnected(&call_id, &record).await,
                    _ => {
                        let data = CallData::from(&*record.lock());
                        let result = inner.gateway.call_state_changed(&data, to).await;
                        self.record_notification(&call_id, result);
                    }
                }
                EventOutcome::Applied { call_id, state: to }
            }
        }
    }

    /// A repeated state tag still counts when it brings the first usable number
    ///
    /// Line drivers report dial tone before the digits are known, so an
    /// outbound call may start without a number and learn it one event later.
    async fn number_supplied_late(&self, call_id: &CallId, event: &CallEvent) -> bool {
        if event.raw_remote_number.trim().is_empty() {
            return false;
        }
        let Some(record) = self.inner.registry.get(call_id) else {
            return false;
        };
        {
            let mut call = record.lock();
            if !call.remote_number.is_empty() || call.state() == CallState::Idle || call.state().is_terminal() {
                return false;
            }
            call.merge_event_details(event);
        }
        self.on_number_arrived(call_id, &record).await;
        true
    }

    /// Claim a matching dial request and attach the routed directory matches
    fn resolve_caller(&self, call_id: &CallId, record: &SharedRecord) -> Resolution {
        let inner = &self.inner;
        let (direction, number) = {
            let call = record.lock();
            (call.direction, call.remote_number.clone())
        };

        let pending = match direction {
            CallDirection::Outbound => inner.registry.try_consume_pending(&number),
            CallDirection::Inbound => None,
        };

        let mut candidates = inner.routing.apply_routing(&number, inner.directory.lookup(&number));
        if let Some(hint) = pending.as_ref().and_then(|p| p.contact_hint.as_deref()) {
            if let Some(position) = candidates.iter().position(|c| c.contact_id() == hint) {
                let hinted = candidates.remove(position);
                candidates.insert(0, hinted);
            }
        }

        let mut call = record.lock();
        let correlated = pending.is_some();
        if let Some(pending) = pending {
            info!(call_id = %call_id, sync_id = %pending.sync_id, "Outbound call matched dial request");
            call.sync_id = Some(pending.sync_id);
            call.contact_hint = pending.contact_hint;
        }
        call.resolved_contact = candidates.first().cloned();
        let candidate_count = candidates.len();
        call.candidates = candidates;

        Resolution {
            data: CallData::from(&*call),
            candidate_count,
            correlated,
            ambiguous: call.is_ambiguous(),
        }
    }

    async fn on_call_started(&self, call_id: &CallId, record: &SharedRecord) {
        let Resolution {
            data, candidate_count, ..
        } = self.resolve_caller(call_id, record);

        info!(
            call_id = %call_id,
            direction = %data.direction,
            contact_id = data.contact_id.as_deref().unwrap_or(""),
            candidates = candidate_count,
            "New call"
        );
        let result = self.inner.gateway.new_call(&data).await;
        self.record_notification(call_id, result);
    }

    /// The call started without a number and has just learned one
    async fn on_number_arrived(&self, call_id: &CallId, record: &SharedRecord) {
        let resolution = self.resolve_caller(call_id, record);
        info!(
            call_id = %call_id,
            contact_id = resolution.data.contact_id.as_deref().unwrap_or(""),
            candidates = resolution.candidate_count,
            correlated = resolution.correlated,
            "Caller number arrived after call start"
        );

        if resolution.data.contact_id.is_some() || resolution.correlated {
            let result = self.inner.gateway.contact_assignment_changed(&resolution.data).await;
            self.record_notification(call_id, result);
        }
        if resolution.ambiguous && resolution.data.state == CallState::Connected {
            self.maybe_disambiguate(call_id);
        }
    }

    async fn on_connected(&self, call_id: &CallId, record: &SharedRecord) {
        let inner = &self.inner;
        let (data, ambiguous) = {
            let call = record.lock();
            (CallData::from(&*call), call.is_ambiguous())
        };

        let result = inner.gateway.call_state_changed(&data, CallState::Connected).await;
        self.record_notification(call_id, result);

        if ambiguous {
            self.maybe_disambiguate(call_id);
        }
    }

    fn maybe_disambiguate(&self, call_id: &CallId) {
        if !self.inner.config.disambiguation.enabled {
            return;
        }
        if let Some(chooser) = self.inner.chooser.clone() {
            self.schedule_disambiguation(call_id.clone(), chooser);
        }
    }

    fn schedule_disambiguation(&self, call_id: CallId, chooser: Arc<dyn ContactChooser>) {
        let token = self.inner.shutdown.child_token();
        if let Some(previous) = self.inner.disambiguations.insert(call_id.clone(), token.clone()) {
            previous.cancel();
        }

        let delay = self.inner.config.disambiguation.delay();
        let processor = self.clone();
        debug!(call_id = %call_id, delay_ms = delay.as_millis() as u64, "Disambiguation scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(call_id = %call_id, "Disambiguation cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    processor.disambiguate(&call_id, &token, chooser).await;
                }
            }
            processor.inner.disambiguations.remove(&call_id);
        });
    }

    async fn disambiguate(&self, call_id: &CallId, token: &CancellationToken, chooser: Arc<dyn ContactChooser>) {
        let inner = &self.inner;
        let Some(record) = inner.registry.get(call_id) else {
            return;
        };
        let (data, candidates) = {
            let call = record.lock();
            if call.state() != CallState::Connected {
                return;
            }
            (CallData::from(&*call), call.candidates.clone())
        };

        let choice = tokio::select! {
            _ = token.cancelled() => {
                debug!(call_id = %call_id, "Disambiguation cancelled while presented");
                return;
            }
            choice = chooser.choose(&data, &candidates) => choice,
        };
        let Some(chosen_id) = choice else {
            debug!(call_id = %call_id, "Contact choice dismissed");
            return;
        };

        let (number, data) = {
            let mut call = record.lock();
            if call.state().is_terminal() || call.contact_id() == Some(chosen_id.as_str()) {
                return;
            }
            let Some(chosen) = call.candidates.iter().find(|c| c.contact_id() == chosen_id).cloned() else {
                warn!(call_id = %call_id, contact_id = %chosen_id, "Chosen contact is not a candidate");
                return;
            };
            call.resolved_contact = Some(chosen);
            (call.remote_number.clone(), CallData::from(&*call))
        };

        info!(call_id = %call_id, contact_id = %chosen_id, "Contact reassigned");
        inner.routing.record_usage(&number, &chosen_id);
        let result = inner.gateway.contact_assignment_changed(&data).await;
        self.record_notification(call_id, result);
    }

    async fn on_disconnected(&self, call_id: &CallId, record: &SharedRecord) {
        let inner = &self.inner;
        if let Some((_, token)) = inner.disambiguations.remove(call_id) {
            token.cancel();
        }

        let (data, note) = {
            let call = record.lock();
            (CallData::from(&*call), journal_note(&call))
        };

        let result = inner.gateway.call_state_changed(&data, CallState::Disconnected).await;
        self.record_notification(call_id, result);
        if inner.config.journal.enabled {
            let result = inner.gateway.new_journal_entry(&data, &note).await;
            self.record_notification(call_id, result);
        }

        inner.registry.remove(call_id);
        inner.last_tags.remove(call_id);

        if let Some(history) = &inner.history {
            let finished = record.lock().clone();
            if let Err(e) = self.store_history(history.as_ref(), finished).await {
                bump(&inner.counters.history_failures);
                warn!(call_id = %call_id, error = %e, category = e.category(), "Failed to store finished call");
            }
        }

        bump(&inner.counters.calls_completed);
        info!(call_id = %call_id, duration_secs = data.duration_secs.unwrap_or(0), "Call finished");
    }

    /// Hand a finished call to the history store within the call timeout
    async fn store_history(&self, history: &dyn CallHistoryStore, finished: CallRecord) -> Result<()> {
        let limit = self.inner.config.resilience.call_timeout();
        match tokio::time::timeout(limit, history.append(finished)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ BridgeError::History { .. })) => Err(e),
            Ok(Err(e)) => Err(BridgeError::history(e.to_string())),
            Err(_) => Err(BridgeError::history(format!("no answer within {:?}", limit))),
        }
    }

    /// Check whether the accounting system is up; never moves the circuit breaker
    pub async fn probe_accounting(&self) -> bool {
        let reachable = self.inner.gateway.probe().await;
        if !reachable {
            bump(&self.inner.counters.probes_failed);
        }
        reachable
    }

    fn record_notification(&self, call_id: &CallId, result: Result<()>) {
        let counters = &self.inner.counters;
        match result {
            Ok(()) => bump(&counters.notifications_sent),
            Err(BridgeError::CircuitOpen { operation }) => {
                bump(&counters.notifications_skipped);
                debug!(call_id = %call_id, operation = %operation, "Notification skipped");
            }
            Err(e) => {
                bump(&counters.notifications_failed);
                debug!(call_id = %call_id, error = %e, "Notification not delivered");
            }
        }
    }

    /// Forward a click-to-dial request to the active transport
    ///
    /// The request is remembered before the transport is asked, so the
    /// transport's outbound event cannot overtake it. It is withdrawn again
    /// when the transport refuses.
    pub async fn dial(&self, number: &str, sync_id: &str, contact_hint: Option<String>) -> Result<RequestHandle> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        let transport = self.active_transport().ok_or(BridgeError::NoActiveTransport)?;
        let pending = inner.registry.register_pending(number, sync_id, contact_hint)?;

        match transport.make_call(number).await {
            Ok(handle) => {
                info!(transport = %transport.kind(), sync_id = sync_id, handle = %handle, "Dial request forwarded");
                Ok(handle)
            }
            Err(e) => {
                inner.registry.remove_pending(&pending.key, sync_id);
                warn!(transport = %transport.kind(), sync_id = sync_id, error = %e, "Transport refused dial request");
                Err(e.into())
            }
        }
    }

    /// Drop the call carrying `sync_id`, or withdraw its dial request
    pub async fn drop_call(&self, sync_id: &str) -> Result<DropOutcome> {
        let inner = &self.inner;
        if let Some(record) = inner.registry.find_by_sync_id(sync_id) {
            let (kind, handle) = {
                let call = record.lock();
                (call.transport, call.transport_call_id.clone())
            };
            let transport = self.transport_for(kind).ok_or(BridgeError::NoActiveTransport)?;
            transport.drop_call(&handle).await?;
            info!(transport = %kind, sync_id = sync_id, "Drop request forwarded");
            return Ok(DropOutcome::CallDropped);
        }

        if inner.registry.cancel_pending_by_sync_id(sync_id).is_some() {
            info!(sync_id = sync_id, "Dial request withdrawn before the call started");
            return Ok(DropOutcome::PendingCancelled);
        }

        Err(BridgeError::UnknownSyncId {
            sync_id: sync_id.to_string(),
        })
    }

    pub async fn handle_command(&self, command: AccountingCommand) -> Result<CommandOutcome> {
        match command {
            AccountingCommand::Dial {
                number,
                sync_id,
                contact_hint,
            } => self.dial(&number, &sync_id, contact_hint).await.map(CommandOutcome::Dialed),
            AccountingCommand::Drop { sync_id } => self.drop_call(&sync_id).await.map(CommandOutcome::Dropped),
        }
    }

    /// First registered transport that is currently connected
    pub fn active_transport(&self) -> Option<Arc<dyn TransportProvider>> {
        self.inner.transports.iter().find(|t| t.is_connected()).cloned()
    }

    fn transport_for(&self, kind: TransportKind) -> Option<Arc<dyn TransportProvider>> {
        self.inner.transports.iter().find(|t| t.kind() == kind).cloned()
    }

    /// Load contacts from the configured source through the retry policy
    pub async fn reload_directory(&self) -> Result<usize> {
        let source = self.inner.contact_source.as_ref().ok_or(BridgeError::NoContactSource)?;
        self.inner
            .directory
            .reload(source.as_ref(), &self.inner.config.resilience.retry)
            .await
    }

    /// Change the number of trailing digits compared, rebuilding the index
    pub fn set_comparison_length(&self, comparison_length: usize) -> Result<()> {
        if comparison_length != 0 && comparison_length < MIN_SUFFIX_MATCH_LENGTH {
            return Err(BridgeError::invalid_config(format!(
                "comparison length must be 0 or at least {}",
                MIN_SUFFIX_MATCH_LENGTH
            )));
        }
        self.inner.directory.set_comparison_length(comparison_length);
        self.inner.registry.set_comparison_length(comparison_length);
        Ok(())
    }

    /// Drop stale calls, expired dial requests and expired routing entries
    pub fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let report = inner
            .registry
            .sweep(inner.config.registry.stale_call_timeout(), inner.config.registry.pending_dial_timeout());

        for call_id in &report.stale_calls {
            inner.last_tags.remove(call_id);
            if let Some((_, token)) = inner.disambiguations.remove(call_id) {
                token.cancel();
            }
            warn!(call_id = %call_id, "Removed call that never reported its end");
        }
        for pending in &report.expired_dials {
            info!(sync_id = %pending.sync_id, number = %pending.key, "Dial request expired unmatched");
        }

        let purged = inner.routing.purge_expired();
        if purged > 0 {
            debug!(entries = purged, "Expired routing entries purged");
        }
        report
    }
}

struct Resolution {
    data: CallData,
    candidate_count: usize,
    /// A pending dial request was claimed
    correlated: bool,
    ambiguous: bool,
}

/// Human-readable summary of a finished call
fn journal_note(call: &CallRecord) -> String {
    let party = match (&call.resolved_contact, &call.remote_name) {
        (Some(contact), _) => format!("{} ({})", contact.contact_name(), call.remote_number),
        (None, Some(name)) if !name.is_empty() => format!("{} ({})", name, call.remote_number),
        _ if call.remote_number.is_empty() => "unknown number".to_string(),
        _ => call.remote_number.clone(),
    };
    let summary = match call.direction {
        CallDirection::Inbound => format!("Incoming call from {}", party),
        CallDirection::Outbound => format!("Outgoing call to {}", party),
    };

    match call.duration() {
        Some(duration) => {
            let secs = duration.num_seconds().max(0);
            format!("{}, duration {}:{:02}", summary, secs / 60, secs % 60)
        }
        None => format!("{}, not answered", summary),
    }
}
