//! Gateway server
//!
//! Wires the acceptors, authorizer, TCP pool, TLS manager, session table,
//! and metrics registry together. [`Server::bind`] allocates the
//! listeners (so ephemeral ports are observable before traffic flows),
//! [`Server::run`] drives the accept loops and background tasks, and
//! [`Server::shutdown`] stops accepting immediately and gives in-flight
//! bridges a bounded grace period to drain.

pub mod metrics;
pub mod selftest;
pub mod session;
pub mod tls;

mod quic;
mod ws;

pub use metrics::{ActiveGuard, MetricsRegistry, StreamMetrics};
pub use session::{Session, SessionActivity, SessionTable};
pub use tls::{CertIdentity, TlsManager};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quinn::VarInt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::{Bridge, TcpPool};
use crate::config::{parse_listen_addr, Config};
use crate::error::{AnylinkError, ServerError};
use crate::rules::TargetAuthorizer;

/// State shared by the acceptors and stream handlers
pub(crate) struct GatewayState {
    pub(crate) cfg: Arc<Config>,
    pub(crate) authorizer: Arc<TargetAuthorizer>,
    pub(crate) pool: Arc<TcpPool>,
    pub(crate) tls: Arc<TlsManager>,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) shutdown: broadcast::Sender<()>,
}

/// Close a bridge when the global shutdown signal fires
pub(crate) fn spawn_close_watcher(
    shared: &Arc<GatewayState>,
    bridge: &Arc<Bridge>,
) -> JoinHandle<()> {
    let mut rx = shared.shutdown.subscribe();
    let bridge = Arc::clone(bridge);
    tokio::spawn(async move {
        if rx.recv().await.is_ok() {
            bridge.close();
        }
    })
}

/// The transport gateway
pub struct Server {
    state: Arc<GatewayState>,
    ws_listener: Mutex<Option<TcpListener>>,
    ws_addr: SocketAddr,
    endpoint: quinn::Endpoint,
    quic_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Validate the configuration and bind both listeners
    ///
    /// # Errors
    ///
    /// Returns [`AnylinkError`] on invalid configuration, rule compile
    /// errors, TLS bootstrap failure, or bind failure.
    pub async fn bind(cfg: Config) -> Result<Self, AnylinkError> {
        cfg.validate()?;

        let authorizer = Arc::new(TargetAuthorizer::compile(&cfg.allowed_targets)?);
        let pool = Arc::new(TcpPool::new(cfg.tcp_pool_size));
        let tls = TlsManager::new(
            cfg.tls_rotation(),
            &cfg.alpn,
            cfg.client_auth,
            &cfg.client_cas,
        )?;
        let sessions = Arc::new(SessionTable::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let (shutdown, _) = broadcast::channel(4);

        let ws_bind = parse_listen_addr(&cfg.ws_listen)?;
        let ws_listener = TcpListener::bind(ws_bind)
            .await
            .map_err(|e| ServerError::Bind {
                addr: ws_bind.to_string(),
                reason: e.to_string(),
            })?;
        let ws_addr = ws_listener.local_addr().map_err(ServerError::IoError)?;

        let quic_bind = parse_listen_addr(&cfg.quic_listen)?;
        let endpoint = quic::build_endpoint(quic_bind, &tls)?;
        let quic_addr = endpoint.local_addr().map_err(ServerError::IoError)?;

        info!(ws = %ws_addr, quic = %quic_addr, "gateway bound");

        let state = Arc::new(GatewayState {
            cfg: Arc::new(cfg),
            authorizer,
            pool,
            tls,
            sessions,
            metrics,
            shutdown,
        });

        Ok(Self {
            state,
            ws_listener: Mutex::new(Some(ws_listener)),
            ws_addr,
            endpoint,
            quic_addr,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Actual WebSocket listener address
    #[must_use]
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Actual QUIC endpoint address
    #[must_use]
    pub fn quic_addr(&self) -> SocketAddr {
        self.quic_addr
    }

    /// The metrics registry
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.state.metrics)
    }

    /// The outbound TCP pool
    #[must_use]
    pub fn pool(&self) -> Arc<TcpPool> {
        Arc::clone(&self.state.pool)
    }

    /// The TLS identity manager
    #[must_use]
    pub fn tls(&self) -> Arc<TlsManager> {
        Arc::clone(&self.state.tls)
    }

    /// Number of live QUIC sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Run the acceptors and background tasks until shutdown
    ///
    /// May be called once; resolves after [`shutdown`](Self::shutdown)
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShuttingDown`] on a second call.
    pub async fn run(&self) -> Result<(), AnylinkError> {
        let listener = self
            .ws_listener
            .lock()
            .take()
            .ok_or(ServerError::ShuttingDown)?;

        {
            let mut tasks = self.tasks.lock();
            tasks.push(self.state.tls.spawn_rotation());
            tasks.push(
                self.state
                    .sessions
                    .run_reaper(self.state.shutdown.subscribe()),
            );
            tasks.push(tokio::spawn(ws::run_ws_acceptor(
                Arc::clone(&self.state),
                listener,
            )));
            tasks.push(tokio::spawn(quic::run_quic_acceptor(
                Arc::clone(&self.state),
                self.endpoint.clone(),
            )));
        }

        let mut shutdown_rx = self.state.shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    /// Stop accepting, drain in-flight bridges for up to `grace`, then
    /// force-close everything
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down gateway");
        let _ = self.state.shutdown.send(());
        self.state.tls.stop();

        let deadline = Instant::now() + grace;
        while self.state.metrics.active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.state.sessions.close_all(b"server closed");
        self.endpoint.close(VarInt::from_u32(0), b"server closed");
        self.state.pool.drain();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("gateway shutdown complete");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ws_addr", &self.ws_addr)
            .field("quic_addr", &self.quic_addr)
            .field("sessions", &self.state.sessions.len())
            .finish()
    }
}
