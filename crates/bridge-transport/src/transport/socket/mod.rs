//! Socket transport
//!
//! Phones and softphones connect to a TCP listener and speak newline-delimited
//! JSON (see [`message`]). A peer must greet with `HELLO` before anything else;
//! its extension number then scopes every call id it reports.
//!
//! When a peer goes away, each of its calls that never reported `ENDED` is
//! closed with a synthesized `ended` event so nothing downstream keeps a
//! phantom call alive.

pub mod message;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callbridge_infra_common::RetryConfig;
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{CallEvent, StateTag, TransportEvent, TransportKind};
use crate::transport::{deliver, run_with_reconnect, RequestHandle, TransportProvider};

pub use message::{MessageType, SocketMessage, WireCallState, WireDirection};

const PEER_OUTGOING_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub bind_addr: String,
    pub max_line_len: usize,
    /// Highest protocol version accepted in `HELLO`
    pub protocol_version: u32,
    /// Extension that receives outbound commands when several peers are connected
    pub preferred_extension: Option<String>,
    pub hello_timeout_ms: u64,
    pub reconnect: RetryConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4711".to_string(),
            max_line_len: 8 * 1024,
            protocol_version: 1,
            preferred_extension: None,
            hello_timeout_ms: 10_000,
            reconnect: RetryConfig::slow(),
        }
    }
}

struct Peer {
    extension: String,
    greeted_order: u64,
    outgoing: mpsc::Sender<SocketMessage>,
    open_calls: Mutex<HashMap<String, CallEvent>>,
}

struct SocketShared {
    config: SocketConfig,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peers: DashMap<u64, Arc<Peer>>,
    next_peer_id: AtomicU64,
    greet_counter: AtomicU64,
}

impl SocketShared {
    /// Peer that should receive an outbound command
    fn command_target(&self) -> Option<Arc<Peer>> {
        if let Some(preferred) = self.config.preferred_extension.as_deref() {
            let found = self
                .peers
                .iter()
                .find(|entry| entry.value().extension == preferred)
                .map(|entry| entry.value().clone());
            if found.is_some() {
                return found;
            }
        }
        self.peers
            .iter()
            .max_by_key(|entry| entry.value().greeted_order)
            .map(|entry| entry.value().clone())
    }

    fn peer_for_extension(&self, extension: &str) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| entry.value().extension == extension)
            .max_by_key(|entry| entry.value().greeted_order)
            .map(|entry| entry.value().clone())
    }
}

pub struct SocketTransport {
    shared: Arc<SocketShared>,
    token: CancellationToken,
    started: Mutex<bool>,
}

impl SocketTransport {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                config,
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                peers: DashMap::new(),
                next_peer_id: AtomicU64::new(0),
                greet_counter: AtomicU64::new(0),
            }),
            token: CancellationToken::new(),
            started: Mutex::new(false),
        }
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Number of greeted peers
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }
}

async fn run_accept_loop(
    shared: Arc<SocketShared>,
    events: mpsc::Sender<TransportEvent>,
    token: CancellationToken,
) -> Result<()> {
    let listener = {
        let prebound = shared.listener.lock().take();
        match prebound {
            Some(listener) => listener,
            None => {
                let addr = shared
                    .local_addr
                    .lock()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| shared.config.bind_addr.clone());
                TcpListener::bind(addr).await?
            }
        }
    };

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(peer = %addr, "Socket peer connected");
        let shared = shared.clone();
        let events = events.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, shared, events, token).await {
                warn!(peer = %addr, error = %e, "Socket peer dropped");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<SocketShared>,
    events: mpsc::Sender<TransportEvent>,
    token: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(shared.config.max_line_len));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let hello_timeout = Duration::from_millis(shared.config.hello_timeout_ms);
    let first = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        first = tokio::time::timeout(hello_timeout, lines.next()) => {
            first.map_err(|_| Error::Timeout(hello_timeout))?
        }
    };
    let hello = match first {
        None => return Ok(()),
        Some(line) => SocketMessage::parse(&line.map_err(|e| Error::Protocol(e.to_string()))?)?,
    };
    if hello.message_type != MessageType::Hello {
        return Err(Error::Protocol(format!("expected HELLO, got {:?}", hello.message_type)));
    }
    let version = hello.version.unwrap_or(0);
    if version == 0 || version > shared.config.protocol_version {
        return Err(Error::UnsupportedVersion(version));
    }
    let extension = hello
        .extension_number
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| Error::Protocol("HELLO without extensionNumber".into()))?;

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel(PEER_OUTGOING_CAPACITY);
    let peer_id = shared.next_peer_id.fetch_add(1, Ordering::SeqCst);
    let peer = Arc::new(Peer {
        extension: extension.clone(),
        greeted_order: shared.greet_counter.fetch_add(1, Ordering::SeqCst),
        outgoing: outgoing_tx,
        open_calls: Mutex::new(HashMap::new()),
    });
    shared.peers.insert(peer_id, peer.clone());
    info!(peer = %addr, extension = %extension, version = version, "Socket peer greeted");

    let result = async {
        deliver(&events, TransportEvent::Connected { transport: TransportKind::Socket }).await?;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                line = lines.next() => match line {
                    None => return Ok(()),
                    Some(line) => {
                        let line = line.map_err(|e| Error::Protocol(e.to_string()))?;
                        if !line.trim().is_empty() {
                            handle_peer_line(&peer, &events, &line).await?;
                        }
                    }
                },
                Some(command) = outgoing_rx.recv() => {
                    let line = command.to_line()?;
                    writer.send(line).await.map_err(|e| Error::Protocol(e.to_string()))?;
                }
            }
        }
    }
    .await;

    shared.peers.remove(&peer_id);
    let orphaned: Vec<CallEvent> = peer.open_calls.lock().drain().map(|(_, event)| event).collect();
    for mut event in orphaned {
        debug!(call_id = %event.transport_call_id, "Ending call of departed socket peer");
        event.state = StateTag::Ended;
        event.timestamp = Utc::now();
        if deliver(&events, TransportEvent::Call(event)).await.is_err() {
            break;
        }
    }
    info!(peer = %addr, extension = %extension, "Socket peer disconnected");

    result
}

async fn handle_peer_line(peer: &Peer, events: &mpsc::Sender<TransportEvent>, line: &str) -> Result<()> {
    let message = SocketMessage::parse(line)?;
    if message.message_type != MessageType::CallEvent {
        debug!(extension = %peer.extension, message_type = ?message.message_type, "Ignoring socket message");
        return Ok(());
    }

    let event = message.to_call_event(&peer.extension)?;
    {
        let mut open = peer.open_calls.lock();
        if event.state == StateTag::Ended {
            open.remove(&event.transport_call_id);
        } else {
            open.insert(event.transport_call_id.clone(), event.clone());
        }
    }
    deliver(events, TransportEvent::Call(event)).await
}

#[async_trait]
impl TransportProvider for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::Config("socket transport already started".into()));
            }
            *started = true;
        }

        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.shared.local_addr.lock() = Some(local_addr);
        *self.shared.listener.lock() = Some(listener);
        info!(addr = %local_addr, "Socket transport listening");

        let shared = self.shared.clone();
        let token = self.token.clone();
        let policy = self.shared.config.reconnect.clone();

        tokio::spawn(async move {
            run_with_reconnect(TransportKind::Socket, policy, token.clone(), events.clone(), || {
                run_accept_loop(shared.clone(), events.clone(), token.clone())
            })
            .await;
        });

        Ok(())
    }

    async fn make_call(&self, destination: &str) -> Result<RequestHandle> {
        let peer = self.shared.command_target().ok_or(Error::NotConnected)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        peer.outgoing
            .send(SocketMessage::make_call(request_id.clone(), destination))
            .await
            .map_err(|_| Error::NotConnected)?;
        info!(extension = %peer.extension, destination = destination, request_id = %request_id, "Sent MAKE_CALL");
        Ok(RequestHandle(request_id))
    }

    async fn drop_call(&self, call_handle: &str) -> Result<()> {
        let (extension, call_id) = call_handle
            .split_once('/')
            .ok_or_else(|| Error::Rejected(format!("not a socket call id: {}", call_handle)))?;
        let peer = self.shared.peer_for_extension(extension).ok_or(Error::NotConnected)?;
        peer.outgoing
            .send(SocketMessage::drop_call(call_id))
            .await
            .map_err(|_| Error::NotConnected)
    }

    fn is_connected(&self) -> bool {
        !self.shared.peers.is_empty()
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        self.shared.listener.lock().take();
        Ok(())
    }
}
