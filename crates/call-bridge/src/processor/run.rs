//! The processor's event loop
//!
//! [`CallEventProcessor::run`] starts every transport and merges their event
//! channels into one stream. Each call gets a lane: an unbounded queue plus a
//! task that feeds the call's events to [`CallEventProcessor::handle_event`]
//! one at a time. A lane reports back once its call has left the registry and
//! every event sent to it has been handled; only then is it closed, so a call's
//! events are never split across two concurrently running lanes.
//!
//! Shutdown order:
//!
//! 1. leave the select loop,
//! 2. stop the transports (some emit `ended` events for calls they abandon),
//! 3. flush what is still buffered in the transport channels into the lanes,
//! 4. close the lanes and give them a bounded period to finish.

use std::collections::HashMap;
use std::time::Duration;

use callbridge_transport::{CallEvent, TransportEvent};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use super::stats::{bump, drop_one};
use super::{CallEventProcessor, EventOutcome};
use crate::registry::CallId;

const EVENT_QUEUE_DEPTH: usize = 256;
const LANE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for flushing the transport channels on shutdown
const STREAM_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
/// Flushing stops once no event arrived for this long
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_millis(250);

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sent by a lane whose call is no longer registered
struct LaneIdle {
    call_id: CallId,
    generation: u64,
    /// Events the lane had handled when it reported
    handled: u64,
}

struct Lane {
    generation: u64,
    tx: mpsc::UnboundedSender<CallEvent>,
    sent: u64,
}

/// Keeps the `lanes_open` gauge right even when a lane task is aborted
struct LaneGauge(CallEventProcessor);

impl LaneGauge {
    fn open(processor: CallEventProcessor) -> Self {
        bump(&processor.inner.counters.lanes_open);
        Self(processor)
    }
}

impl Drop for LaneGauge {
    fn drop(&mut self) {
        drop_one(&self.0.inner.counters.lanes_open);
    }
}

struct Lanes {
    processor: CallEventProcessor,
    open: HashMap<CallId, Lane>,
    tasks: JoinSet<()>,
    idle_tx: mpsc::UnboundedSender<LaneIdle>,
    next_generation: u64,
}

impl Lanes {
    fn new(processor: CallEventProcessor, idle_tx: mpsc::UnboundedSender<LaneIdle>) -> Self {
        Self {
            processor,
            open: HashMap::new(),
            tasks: JoinSet::new(),
            idle_tx,
            next_generation: 0,
        }
    }

    fn dispatch(&mut self, event: CallEvent) {
        let call_id = CallId::for_event(&event);
        let event = match self.open.get_mut(&call_id) {
            Some(lane) => match lane.tx.send(event) {
                Ok(()) => {
                    lane.sent += 1;
                    return;
                }
                // lane task is gone; start a fresh one
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let mut lane = self.spawn(call_id.clone());
        if lane.tx.send(event).is_ok() {
            lane.sent += 1;
        }
        self.open.insert(call_id, lane);
    }

    fn spawn(&mut self, call_id: CallId) -> Lane {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (tx, mut rx) = mpsc::unbounded_channel::<CallEvent>();
        let gauge = LaneGauge::open(self.processor.clone());
        let idle_tx = self.idle_tx.clone();

        self.tasks.spawn(async move {
            let processor = &gauge.0;
            let mut handled = 0;
            while let Some(event) = rx.recv().await {
                if let EventOutcome::Rejected { from, to } = processor.handle_event(event).await {
                    debug!(call_id = %call_id, from = %from, to = %to, "Event dropped by state machine");
                }
                handled += 1;
                if processor.inner.registry.get(&call_id).is_none() {
                    let _ = idle_tx.send(LaneIdle {
                        call_id: call_id.clone(),
                        generation,
                        handled,
                    });
                }
            }
        });

        Lane { generation, tx, sent: 0 }
    }

    /// Close the lane if nothing was sent to it since it went idle
    fn on_idle(&mut self, report: LaneIdle) {
        let caught_up = self
            .open
            .get(&report.call_id)
            .is_some_and(|lane| lane.generation == report.generation && lane.sent == report.handled);
        if caught_up && self.processor.inner.registry.get(&report.call_id).is_none() {
            self.open.remove(&report.call_id);
            debug!(call_id = %report.call_id, "Call lane closed");
        }
    }

    fn close(&mut self, call_id: &CallId) {
        self.open.remove(call_id);
    }

    fn len(&self) -> usize {
        self.open.len()
    }

    /// Close every lane and wait for queued events to be handled
    async fn drain(mut self, limit: Duration) {
        self.open.clear();
        let drained = tokio::time::timeout(limit, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(lanes = self.tasks.len(), "Call lanes did not drain in time, aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

impl CallEventProcessor {
    /// Start every transport and process their events until shutdown
    ///
    /// Events of one call are handled in order on that call's lane; different
    /// calls proceed concurrently. Besides events the loop drives the registry
    /// sweep, the optional directory reload and the accounting reachability
    /// probe. On shutdown the transports are stopped, their buffered events are
    /// still dispatched, and the lanes get a bounded period to drain.
    pub async fn run(&self) -> crate::error::Result<()> {
        let inner = &self.inner;

        let mut streams = StreamMap::new();
        for (index, transport) in inner.transports.iter().enumerate() {
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            match transport.start(tx).await {
                Ok(()) => {
                    info!(transport = %transport.kind(), "Transport started");
                    streams.insert(index, ReceiverStream::new(rx));
                }
                Err(e) => {
                    error!(transport = %transport.kind(), error = %e, "Transport failed to start");
                }
            }
        }
        if streams.is_empty() {
            warn!("No transport is delivering events");
        }

        if inner.contact_source.is_some() {
            let processor = self.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.reload_directory().await {
                    warn!(error = %e, "Initial directory load failed");
                }
            });
        }

        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let mut lanes = Lanes::new(self.clone(), idle_tx);
        let mut sweep = periodic(inner.config.registry.sweep_interval());
        let mut reload = match (&inner.contact_source, inner.config.directory.reload_interval()) {
            (Some(_), Some(period)) => Some(periodic(period)),
            _ => None,
        };
        let mut probe = inner.config.resilience.probe_interval().map(periodic);

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                Some((_, event)) = streams.next() => {
                    self.dispatch(event, &mut lanes);
                }
                Some(report) = idle_rx.recv() => lanes.on_idle(report),
                _ = sweep.tick() => {
                    for call_id in self.sweep().stale_calls {
                        lanes.close(&call_id);
                    }
                }
                _ = tick(&mut reload) => {
                    let processor = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = processor.reload_directory().await {
                            debug!(error = %e, "Periodic directory reload failed");
                        }
                    });
                }
                _ = tick(&mut probe) => {
                    let processor = self.clone();
                    tokio::spawn(async move {
                        processor.probe_accounting().await;
                    });
                }
                Some(joined) = lanes.tasks.join_next(), if !lanes.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Call lane panicked");
                        }
                    }
                }
            }
        }

        info!(calls = inner.registry.len(), lanes = lanes.len(), "Call event processor stopping");
        for transport in &inner.transports {
            if let Err(e) = transport.shutdown().await {
                warn!(transport = %transport.kind(), error = %e, "Transport shutdown failed");
            }
        }

        let flush_deadline = Instant::now() + STREAM_FLUSH_TIMEOUT;
        let mut flushed = 0usize;
        while Instant::now() < flush_deadline {
            match tokio::time::timeout(STREAM_IDLE_TIMEOUT, streams.next()).await {
                Ok(Some((_, event))) => {
                    self.dispatch(event, &mut lanes);
                    flushed += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        if flushed > 0 {
            debug!(events = flushed, "Dispatched events buffered at shutdown");
        }

        lanes.drain(LANE_DRAIN_TIMEOUT).await;
        info!("Call event processor stopped");
        Ok(())
    }

    fn dispatch(&self, event: TransportEvent, lanes: &mut Lanes) {
        match event {
            TransportEvent::Call(event) => lanes.dispatch(event),
            TransportEvent::Connected { transport } => {
                info!(transport = %transport, "Transport connected");
            }
            TransportEvent::Disconnected { transport, reason } => {
                warn!(transport = %transport, reason = %reason, "Transport disconnected");
            }
            TransportEvent::Failed { transport, error } => {
                error!(transport = %transport, error = %error, "Transport abandoned for this session");
            }
        }
    }
}
