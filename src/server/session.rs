//! QUIC session table and idle reaper
//!
//! A [`Session`] owns one QUIC connection, the set of bridges running on
//! its streams, and an idle timestamp. The timestamp is refreshed when a
//! stream is accepted and whenever bytes move on any of the session's
//! bridges, so long-lived interactive sessions that open no new streams
//! are not evicted.
//!
//! The reaper scans the table every 10 seconds and closes sessions idle
//! for 30 seconds or more with application error code 0 and reason
//! `idle timeout`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use quinn::VarInt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bridge::{ActivityListener, BridgeStats};

/// Default idle eviction threshold
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default reaper scan cadence
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// One QUIC connection and its active bridges
pub struct Session {
    conn: quinn::Connection,
    streams: Mutex<HashMap<u64, Arc<BridgeStats>>>,
    last_active: Mutex<Instant>,
}

impl Session {
    fn new(conn: quinn::Connection) -> Self {
        Self {
            conn,
            streams: Mutex::new(HashMap::new()),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Refresh the idle timestamp
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// The session's QUIC connection
    #[must_use]
    pub fn connection(&self) -> &quinn::Connection {
        &self.conn
    }

    /// Remote peer address
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Track a bridge running on this session's stream
    pub fn register_stream(&self, stream_id: u64, stats: Arc<BridgeStats>) {
        self.streams.lock().insert(stream_id, stats);
    }

    /// Drop a completed bridge from the stream map
    pub fn remove_stream(&self, stream_id: u64) {
        self.streams.lock().remove(&stream_id);
    }

    /// Number of active bridges
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote_addr())
            .field("streams", &self.stream_count())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

/// Bridge activity callback that refreshes a session's idle timestamp
///
/// Holds only a weak reference so bridges never keep an evicted session
/// alive.
pub struct SessionActivity(Weak<Session>);

impl SessionActivity {
    #[must_use]
    pub fn new(session: &Arc<Session>) -> Arc<Self> {
        Arc::new(Self(Arc::downgrade(session)))
    }
}

impl ActivityListener for SessionActivity {
    fn on_activity(&self) {
        if let Some(session) = self.0.upgrade() {
            session.touch();
        }
    }
}

/// Table of live QUIC sessions with a periodic idle reaper
pub struct SessionTable {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    idle_timeout: Duration,
    scan_interval: Duration,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Create a table with the default 30s/10s reaper timing
    #[must_use]
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_IDLE_TIMEOUT, DEFAULT_SCAN_INTERVAL)
    }

    /// Create a table with explicit reaper timing
    #[must_use]
    pub fn with_timing(idle_timeout: Duration, scan_interval: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            scan_interval,
        }
    }

    /// Register a freshly accepted connection
    pub fn insert(&self, conn: quinn::Connection) -> Arc<Session> {
        let addr = conn.remote_address();
        let session = Arc::new(Session::new(conn));
        self.sessions.insert(addr, Arc::clone(&session));
        trace!(remote = %addr, "session registered");
        session
    }

    /// Drop a session from the table (the connection is not closed)
    pub fn remove(&self, addr: SocketAddr) {
        self.sessions.remove(&addr);
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session with the given reason and clear the table
    pub fn close_all(&self, reason: &[u8]) {
        for entry in &self.sessions {
            entry.value().conn.close(VarInt::from_u32(0), reason);
        }
        self.sessions.clear();
    }

    /// Close and remove sessions idle past the threshold; returns how
    /// many were evicted
    pub fn reap_once(&self) -> usize {
        let idle: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        for addr in &idle {
            if let Some((_, session)) = self.sessions.remove(addr) {
                debug!(remote = %addr, "closing idle session");
                session.conn.close(VarInt::from_u32(0), b"idle timeout");
            }
        }
        idle.len()
    }

    /// Run the reaper until the shutdown signal fires
    pub fn run_reaper(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.scan_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        table.reap_once();
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("session reaper stopped");
                        return;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("sessions", &self.sessions.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
