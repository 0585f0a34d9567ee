//! WebSocket acceptor
//!
//! Serves the WS (or WSS) side of the gateway. The sole handler extracts
//! the target from the request path (`/host:port`) or the `target`
//! query parameter, consults the authorizer before upgrading, obtains a
//! pooled TCP connection, and runs a bridge until completion. Any origin
//! is accepted: browser clients reaching TCP services is the point of
//! the gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};

use super::{spawn_close_watcher, GatewayState};
use crate::bridge::{Bridge, BridgeConfig};

/// WebSocket read limit per message
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config
}

/// Accept loop for the WebSocket listener
pub(crate) async fn run_ws_acceptor(shared: Arc<GatewayState>, listener: TcpListener) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    info!(
        wss = shared.cfg.enable_wss,
        "WebSocket acceptor listening"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("WebSocket acceptor stopped");
                return;
            }
            res = listener.accept() => match res {
                Ok((tcp, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        handle_connection(shared, tcp, peer).await;
                    });
                }
                Err(e) => warn!(error = %e, "WS accept error"),
            }
        }
    }
}

async fn handle_connection(shared: Arc<GatewayState>, tcp: TcpStream, peer: SocketAddr) {
    if shared.cfg.enable_wss {
        let acceptor = TlsAcceptor::from(shared.tls.server_config());
        match acceptor.accept(tcp).await {
            Ok(tls) => serve(shared, tls, peer).await,
            Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
        }
    } else {
        serve(shared, tcp, peer).await;
    }
}

async fn serve<S>(shared: Arc<GatewayState>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // The handshake callback runs before the upgrade completes, so deny
    // and missing-target cases answer with plain HTTP status codes.
    let target_slot = Arc::new(Mutex::new(None::<String>));
    let callback = {
        let slot = Arc::clone(&target_slot);
        let authorizer = Arc::clone(&shared.authorizer);
        move |req: &Request, response: Response| {
            let Some(target) = extract_target(req) else {
                return Err(plain_response(StatusCode::BAD_REQUEST, "missing target"));
            };
            if !authorizer.is_allowed(&target) {
                return Err(plain_response(StatusCode::FORBIDDEN, "target not allowed"));
            }
            *slot.lock() = Some(target);
            Ok(response)
        }
    };

    let mut ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config())).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WS handshake rejected");
            return;
        }
    };

    let Some(target) = target_slot.lock().take() else {
        return;
    };

    let _active = shared.metrics.active_guard();
    let stream_id = format!("ws-{peer}");
    shared.metrics.register_stream(&stream_id);

    let (tcp_conn, backend) = match shared.pool.get(&target).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(target = %target, error = %e, "backend connect failed");
            shared.metrics.add_error(&stream_id);
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "connect failed".into(),
                }))
                .await;
            return;
        }
    };

    debug!(peer = %peer, target = %target, backend = %backend, "ws bridge established");

    let bridge = Arc::new(Bridge::new_ws(
        ws,
        tcp_conn,
        BridgeConfig {
            read_timeout: shared.cfg.read_timeout(),
        },
    ));
    let watcher = spawn_close_watcher(&shared, &bridge);
    let outcome = bridge.wait().await;
    watcher.abort();

    shared
        .metrics
        .add_bytes(&stream_id, outcome.bytes_sent, outcome.bytes_received);
    if !outcome.clean {
        shared.metrics.add_error(&stream_id);
    }
    if let Some(conn) = outcome.tcp {
        shared.pool.put(&backend, conn);
    }

    debug!(
        peer = %peer,
        sent = outcome.bytes_sent,
        received = outcome.bytes_received,
        clean = outcome.clean,
        "ws bridge closed"
    );
}

/// Extract the target from the request: the whole path with the leading
/// slash stripped, when it is non-empty and contains `:`, else the
/// `target` query parameter
fn extract_target(req: &Request) -> Option<String> {
    let path = req.uri().path().trim_start_matches('/');
    if !path.is_empty() && path.contains(':') {
        return Some(path.to_string());
    }

    req.uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("target="))
                .map(ToString::to_string)
        })
        .filter(|t| !t.is_empty())
}

fn plain_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}
