//! The transport abstraction and the shared reconnect loop
//!
//! A transport owns its connection lifecycle: [`TransportProvider::start`] spawns
//! the event-producing loop and returns immediately. Commands flow back through
//! [`TransportProvider::make_call`] and [`TransportProvider::drop_call`].

pub mod line;
pub mod pipe;
pub mod socket;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use callbridge_infra_common::RetryConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorCategory, Result};
use crate::event::{TransportEvent, TransportKind};

/// Opaque handle returned by a transport for an accepted dial request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub String);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A source of normalized call events that also accepts call commands
///
/// # Examples
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use callbridge_transport::{SocketConfig, SocketTransport, TransportEvent, TransportProvider};
/// # async fn example() -> callbridge_transport::Result<()> {
/// let transport: Arc<dyn TransportProvider> = Arc::new(SocketTransport::new(SocketConfig::default()));
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// transport.start(tx).await?;
///
/// while let Some(event) = rx.recv().await {
///     if let TransportEvent::Call(call) = event {
///         println!("{} {} {}", call.transport_call_id, call.state, call.raw_remote_number);
///     }
/// }
/// transport.shutdown().await
/// # }
/// ```
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Which of the event sources this is
    fn kind(&self) -> TransportKind;

    /// Spawn the event loop, delivering into `events`
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Ask the switch to place a call
    async fn make_call(&self, destination: &str) -> Result<RequestHandle>;

    /// Ask the switch to drop a call, by the transport's own call id
    async fn drop_call(&self, call_handle: &str) -> Result<()>;

    /// Whether commands can currently be delivered
    fn is_connected(&self) -> bool;

    /// Stop the event loop and release the connection
    async fn shutdown(&self) -> Result<()>;
}

/// Drive `session` until cancelled, reconnecting according to the error category
///
/// `session` establishes one connection and runs it to completion. It returns
/// `Ok(())` only when the peer closed the link cleanly, which is handled like
/// [`ErrorCategory::ConnectionClosed`].
pub(crate) async fn run_with_reconnect<F, Fut>(
    kind: TransportKind,
    policy: RetryConfig,
    token: CancellationToken,
    events: mpsc::Sender<TransportEvent>,
    mut session: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut transient_failures: u32 = 0;

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = session() => result,
        };

        let delay = match result {
            Ok(()) => {
                transient_failures = 0;
                surface_disconnect(kind, &events, "peer closed the connection").await;
                policy.base_delay()
            }
            Err(e) => match e.category() {
                ErrorCategory::Transient => {
                    if transient_failures >= policy.max_retries {
                        error!(transport = %kind, error = %e, "Giving up after repeated transient failures");
                        let _ = events
                            .send(TransportEvent::Failed { transport: kind, error: e.to_string() })
                            .await;
                        break;
                    }
                    let delay = policy.jittered_delay(transient_failures);
                    transient_failures += 1;
                    debug!(
                        transport = %kind,
                        error = %e,
                        attempt = transient_failures,
                        next_delay_ms = delay.as_millis() as u64,
                        "Transient transport failure, retrying"
                    );
                    delay
                }
                ErrorCategory::ConnectionClosed => {
                    transient_failures = 0;
                    surface_disconnect(kind, &events, &e.to_string()).await;
                    policy.base_delay()
                }
                ErrorCategory::SystemShuttingDown => break,
                ErrorCategory::Permanent => {
                    error!(transport = %kind, error = %e, "Permanent transport failure, abandoning transport");
                    let _ = events
                        .send(TransportEvent::Failed { transport: kind, error: e.to_string() })
                        .await;
                    break;
                }
            },
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(transport = %kind, "Transport loop terminated");
}

async fn surface_disconnect(kind: TransportKind, events: &mpsc::Sender<TransportEvent>, reason: &str) {
    warn!(transport = %kind, reason = reason, "Transport disconnected, will reconnect");
    let _ = events
        .send(TransportEvent::Disconnected { transport: kind, reason: reason.to_string() })
        .await;
}

/// Send a call event, mapping a closed consumer to shutdown
pub(crate) async fn deliver(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> Result<()> {
    events.send(event).await.map_err(|_| Error::ShuttingDown)
}
