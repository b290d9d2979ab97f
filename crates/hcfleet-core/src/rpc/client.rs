//! A JSON-RPC channel over one conductor websocket interface.
//!
//! The socket is owned by a background task. Requests go out through an
//! unbounded queue and are matched to responses by id; signals are decoded
//! and broadcast. When the conductor drops the socket (it does this every
//! time an instance is attached to an interface) the task redials with
//! backoff until the channel is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{wait_reconnected, ConnectionEvent, ConnectionStatus, ConnectionTracker};
use super::message::{decode_inbound, Inbound, RpcErrorObject, RpcRequest};
use crate::error::{FleetError, FleetResult};
use crate::signal::{Signal, SignalKind, SignalStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcErrorObject>>>;

const SIGNAL_BUFFER: usize = 1024;

/// Exponential redial delay
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            current: Duration::from_millis(50),
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// State shared between the channel handle and its socket task
struct Shared {
    name: String,
    url: String,
    pending: Mutex<PendingMap>,
    tracker: ConnectionTracker,
    signals: broadcast::Sender<Signal>,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        match decode_inbound(text) {
            Ok(Inbound::Response { id, outcome }) => match self.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(channel = %self.name, id, "Response for unknown request"),
            },
            Ok(Inbound::Signal(signal)) => {
                trace!(channel = %self.name, kind = ?signal.kind, "Signal received");
                // No subscribers is fine
                let _ = self.signals.send(signal);
            }
            Ok(Inbound::Other(_)) => trace!(channel = %self.name, "Ignoring unrecognised message"),
            Err(e) => debug!(channel = %self.name, error = %e, "Undecodable message"),
        }
    }

    /// Drop every in-flight request; callers observe `ChannelClosed`.
    fn fail_pending(&self) {
        let failed = std::mem::take(&mut *self.pending.lock());
        if !failed.is_empty() {
            debug!(channel = %self.name, count = failed.len(), "Failing in-flight requests");
        }
    }

    /// Discard everything tied to a connection that is gone.
    ///
    /// The queue is drained before pending requests are failed. A call that
    /// registers in between has its request discarded but its entry still
    /// in `pending`, so it is failed rather than left waiting.
    fn abandon_connection(&self, outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
        while outbound_rx.try_recv().is_ok() {}
        self.fail_pending();
    }
}

/// Why a connected socket stopped being served
#[derive(Debug, PartialEq, Eq)]
enum Served {
    Lost,
    Shutdown,
}

/// JSON-RPC client for one conductor interface
pub struct RpcChannel {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcChannel {
    /// Dial `url`. The first connection attempt is not retried.
    pub async fn connect(name: impl Into<String>, url: impl Into<String>) -> FleetResult<Self> {
        let name = name.into();
        let url = url.into();
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let shared = Arc::new(Shared {
            name,
            url,
            pending: Mutex::new(HashMap::new()),
            tracker: ConnectionTracker::new(),
            signals,
        });

        shared.tracker.apply(ConnectionEvent::Dial);
        let ws = match tokio_tungstenite::connect_async(shared.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                shared.tracker.apply(ConnectionEvent::Closed);
                return Err(FleetError::Transport {
                    url: shared.url.clone(),
                    message: e.to_string(),
                });
            }
        };
        shared.tracker.apply(ConnectionEvent::Opened);
        info!(channel = %shared.name, url = %shared.url, "Channel connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(ws, shared.clone(), outbound_rx, shutdown.clone()));

        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            outbound,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.tracker.status()
    }

    /// Call `method` and wait for its response.
    pub async fn call(&self, method: &str, params: Value) -> FleetResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&RpcRequest::new(id, method, &params))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        if self.outbound.send(text).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(FleetError::ChannelClosed(self.shared.name.clone()));
        }
        debug!(channel = %self.shared.name, method, id, "RPC call");

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(FleetError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(FleetError::ChannelClosed(self.shared.name.clone())),
        }
    }

    /// Every signal this channel receives from now on
    pub fn signals(&self) -> SignalStream {
        SignalStream::new(self.shared.signals.subscribe(), None)
    }

    /// Trace signals only
    pub fn trace_signals(&self) -> SignalStream {
        SignalStream::new(self.shared.signals.subscribe(), Some(SignalKind::Trace))
    }

    /// Wait until the channel has reconnected after `since_epoch`.
    pub async fn wait_reconnected(
        &self,
        since_epoch: u64,
        timeout: Option<Duration>,
    ) -> FleetResult<ConnectionStatus> {
        let closed = || FleetError::ChannelClosed(self.shared.name.clone());
        let mut rx = self.shared.tracker.subscribe();
        let wait = async {
            tokio::select! {
                status = wait_reconnected(&mut rx, since_epoch) => status.map_err(|_| closed()),
                _ = self.shutdown.cancelled() => Err(closed()),
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                FleetError::ReconnectTimeout {
                    url: self.shared.url.clone(),
                    waited_ms: limit.as_millis() as u64,
                }
            })?,
        }
    }

    /// Close the socket and stop reconnecting.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(channel = %self.shared.name, error = %e, "Channel task failed");
            }
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("name", &self.shared.name)
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .finish()
    }
}

async fn run(
    mut ws: WsStream,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::default();

    loop {
        let served = serve(ws, &shared, &mut outbound_rx, &shutdown).await;

        shared.abandon_connection(&mut outbound_rx);
        if served == Served::Shutdown {
            break;
        }

        shared.tracker.apply(ConnectionEvent::Closed);
        info!(channel = %shared.name, "Channel lost, reconnecting");

        ws = match redial(&shared, &shutdown, &mut backoff).await {
            Some(ws) => ws,
            None => break,
        };
        backoff.reset();
        let status = shared.tracker.apply(ConnectionEvent::Opened);
        info!(channel = %shared.name, epoch = status.epoch, "Channel reconnected");
    }

    shared.tracker.apply(ConnectionEvent::Shutdown);
    debug!(channel = %shared.name, "Channel task stopped");
}

async fn serve(
    ws: WsStream,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &CancellationToken,
) -> Served {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Served::Shutdown;
            }
            out = outbound_rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(tungstenite::Message::Text(text.into())).await {
                        warn!(channel = %shared.name, error = %e, "Websocket write error");
                        return Served::Lost;
                    }
                }
                // Handle dropped
                None => return Served::Shutdown,
            },
            msg = read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(tungstenite::Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.dispatch(text),
                    Err(_) => debug!(channel = %shared.name, "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = write.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    debug!(channel = %shared.name, "Conductor sent Close frame");
                    return Served::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(channel = %shared.name, error = %e, "Websocket read error");
                    return Served::Lost;
                }
                None => return Served::Lost,
            },
        }
    }
}

async fn redial(
    shared: &Shared,
    shutdown: &CancellationToken,
    backoff: &mut Backoff,
) -> Option<WsStream> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return None,
            attempt = tokio_tungstenite::connect_async(shared.url.as_str()) => attempt,
        };
        match attempt {
            Ok((ws, _response)) => return Some(ws),
            Err(e) => debug!(channel = %shared.name, error = %e, "Redial failed"),
        }
    }
}
