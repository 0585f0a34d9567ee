//! Bidirectional bridge engine
//!
//! A [`Bridge`] couples one client-facing endpoint (a WebSocket connection
//! or a QUIC bidirectional stream) to one TCP connection and forwards
//! bytes in both directions until either side closes or errors. Each
//! bridge runs exactly two copy tasks, one per direction, each with a
//! 32 KiB buffer and an idle read deadline.
//!
//! # Wire formats
//!
//! WebSocket bridges exchange framed binary messages (see [`frame`]);
//! frames carrying a foreign stream id are silently dropped and
//! non-binary messages are ignored. QUIC bridges forward raw bytes with
//! no application framing; when a QUIC bridge is created without a TCP
//! connection, the first chunk read from the stream is interpreted as a
//! UTF-8 `host:port` target, consumed (never forwarded), authorized, and
//! dialed. This is the target handshake.
//!
//! # Close semantics
//!
//! Writes to the client-facing endpoint are serialized: WebSocket bridges
//! feed a dedicated writer task through a channel, QUIC bridges write
//! only from the backend-to-client task. When the client closes cleanly
//! the TCP connection is preserved and handed back in the
//! [`BridgeOutcome`] for pooling; when the backend closes first the
//! client write side is half-closed and the TCP connection is discarded.
//! Errors and read timeouts discard the connection.

mod frame;
mod tcp_pool;

pub use frame::{decode_frame, encode_frame, BRIDGE_STREAM_ID, FRAME_HEADER_LEN};
pub use tcp_pool::TcpPool;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use quinn::{RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::error::ConnectError;

/// Per-direction copy buffer size
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Application error code used to reset a QUIC stream whose target was
/// denied or could not be dialed
const STREAM_REJECT_CODE: u32 = 1;

/// Bridge options
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Idle read deadline for each direction
    pub read_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Byte counters for one bridge, monotonically non-decreasing for the
/// bridge's lifetime
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Bytes forwarded toward the client
    pub bytes_sent: AtomicU64,

    /// Bytes received from the client and forwarded to the backend
    pub bytes_received: AtomicU64,
}

impl BridgeStats {
    fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Current `(bytes_sent, bytes_received)` values
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// Callback invoked whenever bytes move on a bridge
///
/// QUIC bridges use this to refresh their session's idle timestamp so the
/// reaper does not evict sessions with long-lived active streams.
pub trait ActivityListener: Send + Sync {
    fn on_activity(&self);
}

/// Resolves a client-supplied target to an authorized, pooled TCP
/// connection
///
/// Implemented by the server layer (authorizer + pool); the bridge calls
/// it during the QUIC target handshake, before any TCP dial.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Authorize `target` and return a connection plus the backend
    /// address it belongs to
    async fn connect(&self, target: &str) -> Result<(TcpStream, String), ConnectError>;
}

/// How one copy direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirEnd {
    /// The client closed cleanly (WS close frame or QUIC FIN)
    ClientClosed,

    /// The backend reached EOF
    BackendClosed,

    /// Stopped by the sibling direction or an external `close()`
    Interrupted,

    /// Read/write error or idle timeout
    Failed,
}

/// Final state of a completed bridge
#[derive(Debug, Default)]
pub struct BridgeOutcome {
    /// Bytes forwarded toward the client
    pub bytes_sent: u64,

    /// Bytes received from the client
    pub bytes_received: u64,

    /// True unless a direction failed with an error or timeout
    pub clean: bool,

    /// The TCP connection, present only when it is still usable and may
    /// be returned to the pool
    pub tcp: Option<TcpStream>,

    /// Backend address the TCP connection belongs to (set by the QUIC
    /// target handshake)
    pub backend: Option<String>,
}

impl BridgeOutcome {
    fn aborted(stats: &BridgeStats) -> Self {
        let (bytes_sent, bytes_received) = stats.snapshot();
        Self {
            bytes_sent,
            bytes_received,
            clean: false,
            tcp: None,
            backend: None,
        }
    }
}

/// A running duplex bridge
///
/// Owns its two copy tasks. [`wait`](Self::wait) resolves once both have
/// exited; [`close`](Self::close) is idempotent and interrupts them.
pub struct Bridge {
    stats: Arc<BridgeStats>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<BridgeOutcome>>>,
}

impl Bridge {
    /// Start a WebSocket bridge; copying begins immediately
    pub fn new_ws<S>(ws: WebSocketStream<S>, tcp: TcpStream, cfg: BridgeConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stats = Arc::new(BridgeStats::default());
        let (shutdown, _) = broadcast::channel(4);
        // Subscribe before spawning so a close() issued immediately after
        // construction is never missed.
        let rx_client = shutdown.subscribe();
        let rx_backend = shutdown.subscribe();
        let task = spawn_ws(
            ws,
            tcp,
            cfg,
            Arc::clone(&stats),
            shutdown.clone(),
            rx_client,
            rx_backend,
        );

        Self {
            stats,
            shutdown,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    /// Start a QUIC stream bridge; copying begins immediately
    ///
    /// When `tcp` is absent the bridge performs the target handshake: the
    /// first chunk read from the stream names the backend, which is
    /// resolved through `connector` before any dial. A denied or
    /// undialable target resets the stream with a non-zero application
    /// error code.
    pub fn new_quic(
        send: SendStream,
        recv: RecvStream,
        tcp: Option<(TcpStream, String)>,
        cfg: BridgeConfig,
        connector: Option<Arc<dyn TargetConnector>>,
        activity: Option<Arc<dyn ActivityListener>>,
    ) -> Self {
        let stats = Arc::new(BridgeStats::default());
        let (shutdown, _) = broadcast::channel(4);
        let rx_client = shutdown.subscribe();
        let rx_backend = shutdown.subscribe();
        let task = spawn_quic(
            send,
            recv,
            tcp,
            cfg,
            connector,
            activity,
            Arc::clone(&stats),
            shutdown.clone(),
            rx_client,
            rx_backend,
        );

        Self {
            stats,
            shutdown,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    /// Live byte counters for this bridge
    #[must_use]
    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Interrupt both copy tasks. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
    }

    /// Wait for both copy tasks to exit and collect the outcome
    ///
    /// A second call (or a call after the supervisor panicked) yields an
    /// aborted outcome carrying the final counters.
    pub async fn wait(&self) -> BridgeOutcome {
        let handle = self.task.lock().take();
        match handle {
            Some(h) => h.await.unwrap_or_else(|_| BridgeOutcome::aborted(&self.stats)),
            None => BridgeOutcome::aborted(&self.stats),
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (sent, received) = self.stats.snapshot();
        f.debug_struct("Bridge")
            .field("bytes_sent", &sent)
            .field("bytes_received", &received)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn assemble_outcome(
    stats: &BridgeStats,
    client_end: DirEnd,
    backend_end: DirEnd,
    tcp: Option<TcpStream>,
    backend: Option<String>,
) -> BridgeOutcome {
    let (bytes_sent, bytes_received) = stats.snapshot();
    BridgeOutcome {
        bytes_sent,
        bytes_received,
        clean: client_end != DirEnd::Failed && backend_end != DirEnd::Failed,
        tcp,
        backend,
    }
}

// ----- WebSocket bridge -----

#[allow(clippy::too_many_arguments)]
fn spawn_ws<S>(
    ws: WebSocketStream<S>,
    tcp: TcpStream,
    cfg: BridgeConfig,
    stats: Arc<BridgeStats>,
    shutdown: broadcast::Sender<()>,
    rx_client: broadcast::Receiver<()>,
    rx_backend: broadcast::Receiver<()>,
) -> JoinHandle<BridgeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (sink, stream) = ws.split();
        let (tcp_rx, tcp_tx) = tcp.into_split();

        // All WS writes funnel through one writer task so the two copy
        // directions never write the socket concurrently.
        let (msg_tx, msg_rx) = mpsc::channel::<Message>(32);
        let writer = tokio::spawn(ws_writer(sink, msg_rx));

        let c2b = tokio::spawn(ws_client_to_backend(
            stream,
            tcp_tx,
            cfg.read_timeout,
            Arc::clone(&stats),
            rx_client,
            shutdown.clone(),
        ));
        let b2c = tokio::spawn(backend_to_ws(
            tcp_rx,
            msg_tx,
            cfg.read_timeout,
            Arc::clone(&stats),
            rx_backend,
            shutdown.clone(),
        ));

        let (c2b_res, b2c_res) = tokio::join!(c2b, b2c);
        let _ = writer.await;

        let (client_end, tcp_tx) = c2b_res.unwrap_or((DirEnd::Failed, None));
        let (backend_end, tcp_rx) = b2c_res.unwrap_or((DirEnd::Failed, None));

        let tcp = match (tcp_rx, tcp_tx) {
            (Some(rx), Some(tx)) => rx.reunite(tx).ok(),
            _ => None,
        };

        assemble_outcome(&stats, client_end, backend_end, tcp, None)
    })
}

/// Drain the message channel into the WebSocket sink, then close the
/// socket with a normal close frame
async fn ws_writer<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, mut rx: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn ws_client_to_backend<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut tcp_tx: OwnedWriteHalf,
    read_timeout: Duration,
    stats: Arc<BridgeStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> (DirEnd, Option<OwnedWriteHalf>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let end = loop {
        let msg = tokio::select! {
            _ = shutdown_rx.recv() => break DirEnd::Interrupted,
            res = timeout(read_timeout, stream.next()) => match res {
                Err(_) => {
                    debug!("ws read timeout");
                    break DirEnd::Failed;
                }
                Ok(None) => break DirEnd::ClientClosed,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "ws read error");
                    break DirEnd::Failed;
                }
                Ok(Some(Ok(msg))) => msg,
            }
        };

        match msg {
            Message::Binary(data) => match decode_frame(&data) {
                Some((BRIDGE_STREAM_ID, payload)) => {
                    match timeout(read_timeout, tcp_tx.write_all(payload)).await {
                        Ok(Ok(())) => {}
                        _ => break DirEnd::Failed,
                    }
                    stats.add_received(payload.len());
                    trace!(n = payload.len(), "ws->tcp");
                }
                Some((other, _)) => {
                    trace!(stream_id = other, "dropping frame for foreign stream id");
                }
                None => trace!("ignoring malformed frame"),
            },
            Message::Close(_) => break DirEnd::ClientClosed,
            // tungstenite answers pings itself; any arrival refreshed the
            // read deadline above.
            Message::Ping(_) | Message::Pong(_) => {}
            // Text and raw frames are ignored on the data path.
            _ => {}
        }
    };

    let _ = shutdown_tx.send(());
    match end {
        // Leave the TCP write side open so a cleanly closed session can
        // return its connection to the pool.
        DirEnd::ClientClosed | DirEnd::Interrupted => (end, Some(tcp_tx)),
        _ => {
            let _ = tcp_tx.shutdown().await;
            (end, None)
        }
    }
}

async fn backend_to_ws(
    mut tcp_rx: OwnedReadHalf,
    msg_tx: mpsc::Sender<Message>,
    read_timeout: Duration,
    stats: Arc<BridgeStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> (DirEnd, Option<OwnedReadHalf>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let end = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break DirEnd::Interrupted,
            res = timeout(read_timeout, tcp_rx.read(&mut buf)) => match res {
                Err(_) => {
                    debug!("tcp read timeout");
                    break DirEnd::Failed;
                }
                Ok(Ok(0)) => break DirEnd::BackendClosed,
                Ok(Ok(n)) => {
                    let body = encode_frame(BRIDGE_STREAM_ID, &buf[..n]);
                    match timeout(read_timeout, msg_tx.send(Message::Binary(body))).await {
                        Ok(Ok(())) => {}
                        _ => break DirEnd::Failed,
                    }
                    stats.add_sent(n);
                    trace!(n, "tcp->ws");
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "tcp read error");
                    break DirEnd::Failed;
                }
            }
        }
    };

    // Dropping the sender lets the writer task flush and send the close
    // frame, half-closing the client side.
    drop(msg_tx);
    let _ = shutdown_tx.send(());
    match end {
        DirEnd::Interrupted => (end, Some(tcp_rx)),
        _ => (end, None),
    }
}

// ----- QUIC bridge -----

#[allow(clippy::too_many_arguments)]
fn spawn_quic(
    send: SendStream,
    mut recv: RecvStream,
    tcp: Option<(TcpStream, String)>,
    cfg: BridgeConfig,
    connector: Option<Arc<dyn TargetConnector>>,
    activity: Option<Arc<dyn ActivityListener>>,
    stats: Arc<BridgeStats>,
    shutdown: broadcast::Sender<()>,
    rx_client: broadcast::Receiver<()>,
    rx_backend: broadcast::Receiver<()>,
) -> JoinHandle<BridgeOutcome> {
    tokio::spawn(async move {
        let mut send = send;

        // Target handshake: the first chunk names the backend to dial.
        let (tcp, backend) = match tcp {
            Some(pair) => pair,
            None => {
                match quic_target_handshake(&mut send, &mut recv, &cfg, connector.as_deref()).await
                {
                    Some(pair) => pair,
                    None => return BridgeOutcome::aborted(&stats),
                }
            }
        };

        let (tcp_rx, tcp_tx) = tcp.into_split();

        let c2b = tokio::spawn(quic_client_to_backend(
            recv,
            tcp_tx,
            cfg.read_timeout,
            Arc::clone(&stats),
            activity.clone(),
            rx_client,
            shutdown.clone(),
        ));
        let b2c = tokio::spawn(backend_to_quic(
            tcp_rx,
            send,
            cfg.read_timeout,
            Arc::clone(&stats),
            activity,
            rx_backend,
            shutdown.clone(),
        ));

        let (c2b_res, b2c_res) = tokio::join!(c2b, b2c);

        let (client_end, tcp_tx) = c2b_res.unwrap_or((DirEnd::Failed, None));
        let (backend_end, tcp_rx) = b2c_res.unwrap_or((DirEnd::Failed, None));

        let tcp = match (tcp_rx, tcp_tx) {
            (Some(rx), Some(tx)) => rx.reunite(tx).ok(),
            _ => None,
        };

        assemble_outcome(&stats, client_end, backend_end, tcp, Some(backend))
    })
}

/// Read the target address from the first stream chunk and resolve it.
/// Resets the stream with a non-zero code on deny or dial failure.
async fn quic_target_handshake(
    send: &mut SendStream,
    recv: &mut RecvStream,
    cfg: &BridgeConfig,
    connector: Option<&dyn TargetConnector>,
) -> Option<(TcpStream, String)> {
    let reject = |send: &mut SendStream, recv: &mut RecvStream| {
        let _ = send.reset(VarInt::from_u32(STREAM_REJECT_CODE));
        let _ = recv.stop(VarInt::from_u32(STREAM_REJECT_CODE));
    };

    let Some(connector) = connector else {
        warn!("quic bridge started without connector or connection");
        reject(send, recv);
        return None;
    };

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let n = match timeout(cfg.read_timeout, recv.read(&mut buf)).await {
        Ok(Ok(Some(n))) => n,
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
            debug!("quic stream ended before target handshake");
            reject(send, recv);
            return None;
        }
    };

    let Ok(target) = std::str::from_utf8(&buf[..n]) else {
        warn!("quic target handshake was not valid UTF-8");
        reject(send, recv);
        return None;
    };
    let target = target.trim();

    match connector.connect(target).await {
        Ok(pair) => {
            debug!(target = %target, backend = %pair.1, "quic target handshake complete");
            Some(pair)
        }
        Err(e) => {
            warn!(target = %target, error = %e, "quic target rejected");
            reject(send, recv);
            None
        }
    }
}

async fn quic_client_to_backend(
    mut recv: RecvStream,
    mut tcp_tx: OwnedWriteHalf,
    read_timeout: Duration,
    stats: Arc<BridgeStats>,
    activity: Option<Arc<dyn ActivityListener>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> (DirEnd, Option<OwnedWriteHalf>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let (end, reusable) = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break (DirEnd::Interrupted, true),
            res = timeout(read_timeout, recv.read(&mut buf)) => match res {
                Err(_) => {
                    debug!("quic read timeout");
                    break (DirEnd::Failed, false);
                }
                Ok(Ok(Some(n))) => {
                    match timeout(read_timeout, tcp_tx.write_all(&buf[..n])).await {
                        Ok(Ok(())) => {}
                        _ => break (DirEnd::Failed, false),
                    }
                    stats.add_received(n);
                    if let Some(listener) = &activity {
                        listener.on_activity();
                    }
                    trace!(n, "quic->tcp");
                }
                // FIN: clean client close, the connection can be pooled.
                Ok(Ok(None)) => break (DirEnd::ClientClosed, true),
                // Reset by peer: normal termination, but bytes may have
                // been lost mid-stream so the connection is discarded.
                Ok(Err(quinn::ReadError::Reset(_))) => break (DirEnd::ClientClosed, false),
                Ok(Err(e)) => {
                    debug!(error = %e, "quic read error");
                    break (DirEnd::Failed, false);
                }
            }
        }
    };

    let _ = shutdown_tx.send(());
    if reusable {
        (end, Some(tcp_tx))
    } else {
        let _ = tcp_tx.shutdown().await;
        (end, None)
    }
}

async fn backend_to_quic(
    mut tcp_rx: OwnedReadHalf,
    mut send: SendStream,
    read_timeout: Duration,
    stats: Arc<BridgeStats>,
    activity: Option<Arc<dyn ActivityListener>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> (DirEnd, Option<OwnedReadHalf>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let end = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break DirEnd::Interrupted,
            res = timeout(read_timeout, tcp_rx.read(&mut buf)) => match res {
                Err(_) => {
                    debug!("tcp read timeout");
                    break DirEnd::Failed;
                }
                Ok(Ok(0)) => break DirEnd::BackendClosed,
                Ok(Ok(n)) => {
                    match timeout(read_timeout, send.write_all(&buf[..n])).await {
                        Ok(Ok(())) => {}
                        _ => break DirEnd::Failed,
                    }
                    stats.add_sent(n);
                    if let Some(listener) = &activity {
                        listener.on_activity();
                    }
                    trace!(n, "tcp->quic");
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "tcp read error");
                    break DirEnd::Failed;
                }
            }
        }
    };

    // FIN the client write side; a no-op if the stream was already reset.
    let _ = send.finish();
    let _ = shutdown_tx.send(());
    match end {
        DirEnd::Interrupted => (end, Some(tcp_rx)),
        _ => (end, None),
    }
}
