//! Local-pipe transport
//!
//! Talks to a telephony server over a local IPC stream using the framing in
//! [`codec`]. Call notifications arrive as `event=call` messages; commands are
//! sent with a `seq` field which the server echoes back in its reply together
//! with `__answ#` and `reply`.

pub mod codec;
pub mod connector;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callbridge_infra_common::RetryConfig;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{CallDirection, CallEvent, StateTag, TransportEvent, TransportKind};
use crate::transport::{deliver, run_with_reconnect, RequestHandle, TransportProvider};

pub use codec::{PipeFrameCodec, PipeMessage, ANSWER_KEY, REPLY_KEY};
pub use connector::{PipeConnector, PipeStream};

#[cfg(unix)]
pub use connector::UnixSocketConnector;
#[cfg(windows)]
pub use connector::NamedPipeConnector;

const OUTGOING_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPipeConfig {
    /// Largest accepted payload, in bytes
    pub max_frame_len: usize,
    /// How long a command waits for its reply
    pub request_timeout_ms: u64,
    pub reconnect: RetryConfig,
}

impl Default for LocalPipeConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 8 * 1024,
            request_timeout_ms: 5_000,
            reconnect: RetryConfig::slow(),
        }
    }
}

impl LocalPipeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// State shared between the session task and command callers
struct PipeShared {
    outgoing: Mutex<Option<mpsc::Sender<PipeMessage>>>,
    pending: DashMap<u64, oneshot::Sender<PipeMessage>>,
    next_seq: AtomicU64,
    connected: AtomicBool,
}

impl PipeShared {
    fn reset(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.outgoing.lock() = None;
        // Dropping the reply senders wakes every waiting command
        self.pending.clear();
    }
}

pub struct LocalPipeTransport {
    connector: Arc<dyn PipeConnector>,
    config: LocalPipeConfig,
    shared: Arc<PipeShared>,
    token: CancellationToken,
    started: Mutex<bool>,
}

impl LocalPipeTransport {
    pub fn new(connector: Arc<dyn PipeConnector>, config: LocalPipeConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(PipeShared {
                outgoing: Mutex::new(None),
                pending: DashMap::new(),
                next_seq: AtomicU64::new(0),
                connected: AtomicBool::new(false),
            }),
            token: CancellationToken::new(),
            started: Mutex::new(false),
        }
    }

    /// Send a command and wait for the matching reply
    async fn request(&self, mut message: PipeMessage) -> Result<PipeMessage> {
        let outgoing = self.shared.outgoing.lock().clone().ok_or(Error::NotConnected)?;

        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        message.set("seq", seq.to_string());
        if message.to_wire().encode_utf16().count() * 2 > self.config.max_frame_len {
            return Err(Error::Rejected("command exceeds maximum frame length".into()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(seq, reply_tx);

        if outgoing.send(message).await.is_err() {
            self.shared.pending.remove(&seq);
            return Err(Error::NotConnected);
        }

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed("pipe closed before reply".into())),
            Err(_) => {
                self.shared.pending.remove(&seq);
                Err(Error::Timeout(timeout))
            }
        }
    }
}

/// Interpret `reply=ok[:handle]` / `reply=error:reason`
fn interpret_reply(reply: &PipeMessage) -> Result<Option<String>> {
    let value = reply.get(REPLY_KEY).unwrap_or_default();
    let (status, detail) = match value.split_once(':') {
        Some((status, detail)) => (status, Some(detail.to_string())),
        None => (value, None),
    };
    if status.eq_ignore_ascii_case("ok") {
        Ok(detail.filter(|d| !d.is_empty()))
    } else {
        Err(Error::Rejected(detail.unwrap_or_else(|| value.to_string())))
    }
}

fn sanitize(value: &str) -> String {
    value.chars().filter(|c| *c != ',' && *c != '=').collect()
}

/// Build a call event from an `event=call` message
pub fn parse_call_message(message: &PipeMessage) -> Result<CallEvent> {
    let call_id = message
        .get("callid")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Protocol("call event without callid".into()))?;
    let state: StateTag = message
        .get("state")
        .ok_or_else(|| Error::Protocol("call event without state".into()))?
        .parse()?;
    let direction: CallDirection = message
        .get("dir")
        .ok_or_else(|| Error::Protocol("call event without dir".into()))?
        .parse()?;

    let mut event = CallEvent::new(TransportKind::LocalPipe, call_id, direction, state)
        .with_remote_number(message.get("number").unwrap_or_default());
    if let Some(name) = message.get("name") {
        event = event.with_remote_name(name);
    }
    if let Some(called) = message.get("called") {
        event = event.with_called_number(called);
    }
    if let Some(extension) = message.get("ext") {
        event = event.with_extension(extension);
    }
    Ok(event)
}

async fn handle_incoming(
    shared: &PipeShared,
    events: &mpsc::Sender<TransportEvent>,
    message: PipeMessage,
) -> Result<()> {
    if message.is_reply() {
        let seq = message.get("seq").and_then(|s| s.parse::<u64>().ok());
        match seq.and_then(|seq| shared.pending.remove(&seq)) {
            Some((_, waiter)) => {
                let _ = waiter.send(message);
            }
            None => debug!(reply = %message.to_wire(), "Reply without a waiting command"),
        }
        return Ok(());
    }

    match message.get("event") {
        Some("call") => {
            let event = parse_call_message(&message)?;
            deliver(events, TransportEvent::Call(event)).await
        }
        other => {
            debug!(event = ?other, "Ignoring pipe message");
            Ok(())
        }
    }
}

async fn run_pipe_session(
    connector: Arc<dyn PipeConnector>,
    max_frame_len: usize,
    shared: Arc<PipeShared>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let stream = connector.connect().await?;
    let (mut sink, mut frames) = Framed::new(stream, PipeFrameCodec::new(max_frame_len)).split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<PipeMessage>(OUTGOING_CAPACITY);
    *shared.outgoing.lock() = Some(outgoing_tx);
    shared.connected.store(true, Ordering::SeqCst);
    info!(endpoint = %connector.describe(), "Connected to telephony pipe");

    let result = async {
        deliver(&events, TransportEvent::Connected { transport: TransportKind::LocalPipe }).await?;
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    None => return Err(Error::ConnectionClosed("pipe closed by server".into())),
                    Some(Err(e)) => {
                        warn!(error = %e, "Dropping pipe connection");
                        return Err(e);
                    }
                    Some(Ok(message)) => handle_incoming(&shared, &events, message).await?,
                },
                Some(message) = outgoing_rx.recv() => {
                    debug!(command = %message.to_wire(), "Sending pipe command");
                    sink.send(message).await?;
                }
            }
        }
    }
    .await;

    shared.reset();
    result
}

#[async_trait]
impl TransportProvider for LocalPipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalPipe
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::Config("pipe transport already started".into()));
            }
            *started = true;
        }

        let connector = self.connector.clone();
        let shared = self.shared.clone();
        let max_frame_len = self.config.max_frame_len;
        let policy = self.config.reconnect.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            run_with_reconnect(TransportKind::LocalPipe, policy, token, events.clone(), || {
                run_pipe_session(connector.clone(), max_frame_len, shared.clone(), events.clone())
            })
            .await;
            shared.reset();
        });

        Ok(())
    }

    async fn make_call(&self, destination: &str) -> Result<RequestHandle> {
        let command = PipeMessage::new()
            .with("cmd", "makecall")
            .with("number", sanitize(destination));
        let reply = self.request(command).await?;
        let handle = interpret_reply(&reply)?
            .or_else(|| reply.get(ANSWER_KEY).map(str::to_string))
            .unwrap_or_default();
        info!(destination = destination, handle = %handle, "Pipe accepted dial request");
        Ok(RequestHandle(handle))
    }

    async fn drop_call(&self, call_handle: &str) -> Result<()> {
        let command = PipeMessage::new()
            .with("cmd", "dropcall")
            .with("callid", sanitize(call_handle));
        let reply = self.request(command).await?;
        interpret_reply(&reply).map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        self.shared.reset();
        Ok(())
    }
}
