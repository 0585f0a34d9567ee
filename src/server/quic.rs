//! QUIC acceptor
//!
//! Binds a quinn endpoint using the TLS manager's rotating certificate
//! and accepts connections in a loop. Each connection becomes a
//! [`Session`](super::session::Session); each accepted bidirectional
//! stream spawns a bridge with a deferred TCP dial: the bridge's first
//! read supplies the target, which is authorized before the dial. Denied
//! targets reset the stream with a non-zero application error code.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::VarInt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::session::{Session, SessionActivity};
use super::tls::TlsManager;
use super::{spawn_close_watcher, GatewayState};
use crate::bridge::{Bridge, BridgeConfig, TargetConnector, TcpPool};
use crate::error::{ConnectError, ServerError};
use crate::rules::TargetAuthorizer;

/// Connection idle timeout enforced by the QUIC transport
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive ping interval
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum concurrent bidirectional streams per connection
const MAX_BIDI_STREAMS: u32 = 1024;

/// Maximum concurrent unidirectional streams per connection
const MAX_UNI_STREAMS: u32 = 512;

/// Initial per-stream receive window
const STREAM_RECEIVE_WINDOW: u32 = 64 * 1024;

/// Initial per-connection receive window
const CONNECTION_RECEIVE_WINDOW: u32 = 512 * 1024;

/// Authorize-then-dial connector handed to QUIC bridges for the target
/// handshake
pub(crate) struct PoolConnector {
    pub(crate) authorizer: Arc<TargetAuthorizer>,
    pub(crate) pool: Arc<TcpPool>,
}

#[async_trait]
impl TargetConnector for PoolConnector {
    async fn connect(&self, target: &str) -> Result<(TcpStream, String), ConnectError> {
        if !self.authorizer.is_allowed(target) {
            return Err(ConnectError::Denied {
                target: target.to_string(),
            });
        }
        Ok(self.pool.get(target).await?)
    }
}

/// Build the server endpoint with the gateway's transport parameters
pub(crate) fn build_endpoint(
    addr: SocketAddr,
    tls: &TlsManager,
) -> Result<quinn::Endpoint, ServerError> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls.server_config()).map_err(
        |e| ServerError::Bind {
            addr: addr.to_string(),
            reason: format!("QUIC crypto config: {e}"),
        },
    )?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().map_err(|_| {
        ServerError::Bind {
            addr: addr.to_string(),
            reason: "invalid idle timeout".into(),
        }
    })?));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_BIDI_STREAMS));
    transport.max_concurrent_uni_streams(VarInt::from_u32(MAX_UNI_STREAMS));
    transport.stream_receive_window(VarInt::from_u32(STREAM_RECEIVE_WINDOW));
    transport.receive_window(VarInt::from_u32(CONNECTION_RECEIVE_WINDOW));

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport));

    quinn::Endpoint::server(server_config, addr).map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Accept loop for the QUIC endpoint
pub(crate) async fn run_quic_acceptor(shared: Arc<GatewayState>, endpoint: quinn::Endpoint) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    info!("QUIC acceptor listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("QUIC acceptor stopped");
                return;
            }
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shared, incoming).await {
                            debug!(error = %e, "QUIC connection ended");
                        }
                    });
                }
                None => {
                    info!("QUIC endpoint closed");
                    return;
                }
            }
        }
    }
}

/// Handle one QUIC connection: register a session and accept streams
/// until the connection closes
async fn handle_connection(
    shared: Arc<GatewayState>,
    incoming: quinn::Incoming,
) -> Result<(), quinn::ConnectionError> {
    let conn = incoming.accept()?.await?;
    let remote = conn.remote_address();
    let _active = shared.metrics.active_guard();

    debug!(remote = %remote, "QUIC session established");
    let session = shared.sessions.insert(conn.clone());

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                session.touch();
                let stream_id = send.id().index();
                let shared = Arc::clone(&shared);
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    handle_stream(shared, session, send, recv, stream_id, remote).await;
                });
            }
            Err(e) => {
                debug!(remote = %remote, reason = %e, "QUIC session closed");
                break;
            }
        }
    }

    shared.sessions.remove(remote);
    Ok(())
}

/// Run one bridge over an accepted bidirectional stream
async fn handle_stream(
    shared: Arc<GatewayState>,
    session: Arc<Session>,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    stream_id: u64,
    remote: SocketAddr,
) {
    let metrics_id = format!("quic-{remote}-{stream_id}");
    shared.metrics.register_stream(&metrics_id);

    let connector: Arc<dyn TargetConnector> = Arc::new(PoolConnector {
        authorizer: Arc::clone(&shared.authorizer),
        pool: Arc::clone(&shared.pool),
    });

    let bridge = Arc::new(Bridge::new_quic(
        send,
        recv,
        None,
        BridgeConfig {
            read_timeout: shared.cfg.read_timeout(),
        },
        Some(connector),
        Some(SessionActivity::new(&session)),
    ));
    session.register_stream(stream_id, bridge.stats());

    let watcher = spawn_close_watcher(&shared, &bridge);
    let outcome = bridge.wait().await;
    watcher.abort();

    session.remove_stream(stream_id);
    shared
        .metrics
        .add_bytes(&metrics_id, outcome.bytes_sent, outcome.bytes_received);
    if !outcome.clean {
        shared.metrics.add_error(&metrics_id);
    }
    match (outcome.tcp, outcome.backend) {
        (Some(conn), Some(backend)) => shared.pool.put(&backend, conn),
        (Some(_), None) => warn!("bridge returned a connection without a backend address"),
        _ => {}
    }

    debug!(
        remote = %remote,
        stream_id,
        sent = outcome.bytes_sent,
        received = outcome.bytes_received,
        "quic bridge closed"
    );
}
