//! Outbound TCP connection pool
//!
//! The pool keeps a LIFO stack of idle connections per backend address and
//! maps logical targets to one or more backends with per-target
//! round-robin selection. A logical target with no registered backend list
//! is its own single backend.
//!
//! A single mutex guards the internal maps; critical sections are O(1)
//! and dialing happens outside the lock. There is no health check on
//! insert: stale connections surface as a first-write error on next use
//! and callers discard them instead of re-pooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::PoolError;

/// Connect timeout for backend dials
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct PoolInner {
    /// Idle connections per backend address (LIFO)
    idle: HashMap<String, Vec<TcpStream>>,

    /// Logical target -> backend addresses
    backends: HashMap<String, Vec<String>>,

    /// Round-robin counters per logical target
    counters: HashMap<String, u64>,
}

/// Pooled outbound TCP connections with round-robin backend selection
pub struct TcpPool {
    inner: Mutex<PoolInner>,
    max_idle: usize,
    dials: AtomicU64,
}

impl TcpPool {
    /// Create a pool retaining at most `max_idle` idle connections per
    /// backend
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            max_idle,
            dials: AtomicU64::new(0),
        }
    }

    /// Register multiple backend addresses for a logical target
    ///
    /// Subsequent [`get`](Self::get) calls for `logical` rotate across
    /// `backends`. Re-registering resets the round-robin counter.
    pub fn register(&self, logical: impl Into<String>, backends: Vec<String>) {
        let logical = logical.into();
        let mut inner = self.inner.lock();
        inner.counters.insert(logical.clone(), 0);
        inner.backends.insert(logical, backends);
    }

    /// Obtain a TCP connection to a backend of the logical target
    ///
    /// Pops the most recently pooled idle connection for the selected
    /// backend, or dials with a 5-second timeout. Returns the connection
    /// together with the backend address it belongs to, which the caller
    /// passes back to [`put`](Self::put).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] if the target has an empty backend list or
    /// the dial fails or times out.
    pub async fn get(&self, logical: &str) -> Result<(TcpStream, String), PoolError> {
        let backend = {
            let mut inner = self.inner.lock();

            if !inner.backends.contains_key(logical) {
                // Unregistered logical targets dial themselves.
                inner
                    .backends
                    .insert(logical.to_string(), vec![logical.to_string()]);
                inner.counters.insert(logical.to_string(), 0);
            }

            let backends_len = inner.backends[logical].len();
            if backends_len == 0 {
                return Err(PoolError::NoBackends {
                    target: logical.to_string(),
                });
            }

            let counter = inner.counters.entry(logical.to_string()).or_insert(0);
            let backend_idx = (*counter % backends_len as u64) as usize;
            *counter = counter.wrapping_add(1);
            let backend = inner.backends[logical][backend_idx].clone();

            if let Some(conn) = inner.idle.get_mut(&backend).and_then(Vec::pop) {
                trace!(backend = %backend, "reusing pooled connection");
                return Ok((conn, backend));
            }
            backend
        };

        // Dial outside the lock.
        self.dials.fetch_add(1, Ordering::Relaxed);
        let conn = timeout(DIAL_TIMEOUT, TcpStream::connect(&backend))
            .await
            .map_err(|_| PoolError::DialTimeout {
                backend: backend.clone(),
                timeout_secs: DIAL_TIMEOUT.as_secs(),
            })?
            .map_err(|e| PoolError::DialFailed {
                backend: backend.clone(),
                reason: e.to_string(),
            })?;

        debug!(backend = %backend, "dialed backend");
        Ok((conn, backend))
    }

    /// Return a connection to the backend's idle stack
    ///
    /// The connection is dropped (closed) when the stack is already at
    /// capacity.
    pub fn put(&self, backend: &str, conn: TcpStream) {
        let mut inner = self.inner.lock();
        let stack = inner.idle.entry(backend.to_string()).or_default();
        if stack.len() >= self.max_idle {
            trace!(backend = %backend, "idle stack full, closing connection");
            return;
        }
        stack.push(conn);
    }

    /// Number of idle connections pooled for a backend
    #[must_use]
    pub fn idle_count(&self, backend: &str) -> usize {
        self.inner.lock().idle.get(backend).map_or(0, Vec::len)
    }

    /// Total dials performed since startup (monotonic)
    #[must_use]
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Drop every idle connection
    pub fn drain(&self) {
        self.inner.lock().idle.clear();
    }
}

impl std::fmt::Debug for TcpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TcpPool")
            .field("max_idle", &self.max_idle)
            .field("backends", &inner.backends.len())
            .field("idle_stacks", &inner.idle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn sink_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_get_dials_unregistered_target() {
        let (listener, addr) = sink_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = TcpPool::new(4);
        let (conn, backend) = pool.get(&addr).await.unwrap();
        assert_eq!(backend, addr);
        assert_eq!(pool.dials(), 1);
        drop(conn);
    }

    #[tokio::test]
    async fn test_put_then_get_reuses() {
        let (listener, addr) = sink_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = TcpPool::new(4);
        let (conn, backend) = pool.get(&addr).await.unwrap();
        pool.put(&backend, conn);
        assert_eq!(pool.idle_count(&backend), 1);

        let (_conn, _) = pool.get(&addr).await.unwrap();
        assert_eq!(pool.idle_count(&backend), 0);
        assert_eq!(pool.dials(), 1, "second get must reuse, not dial");
    }

    #[tokio::test]
    async fn test_put_respects_capacity() {
        let (listener, addr) = sink_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = TcpPool::new(1);
        let (a, backend) = pool.get(&addr).await.unwrap();
        let (b, _) = pool.get(&addr).await.unwrap();
        pool.put(&backend, a);
        pool.put(&backend, b);
        assert_eq!(pool.idle_count(&backend), 1);
    }

    #[tokio::test]
    async fn test_round_robin_across_backends() {
        let (l1, a1) = sink_listener().await;
        let (l2, a2) = sink_listener().await;
        for l in [l1, l2] {
            tokio::spawn(async move {
                loop {
                    let _ = l.accept().await;
                }
            });
        }

        let pool = TcpPool::new(4);
        pool.register("db", vec![a1.clone(), a2.clone()]);

        let (_c1, b1) = pool.get("db").await.unwrap();
        let (_c2, b2) = pool.get("db").await.unwrap();
        let (_c3, b3) = pool.get("db").await.unwrap();
        assert_ne!(b1, b2);
        assert_eq!(b1, b3);
    }

    #[tokio::test]
    async fn test_empty_backend_list() {
        let pool = TcpPool::new(4);
        pool.register("ghost", Vec::new());
        let err = pool.get("ghost").await.unwrap_err();
        assert!(matches!(err, PoolError::NoBackends { .. }));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let pool = TcpPool::new(4);
        // Dropped listener: connection refused.
        let addr = {
            let (listener, addr) = sink_listener().await;
            drop(listener);
            addr
        };
        let err = pool.get(&addr).await.unwrap_err();
        assert!(matches!(err, PoolError::DialFailed { .. }));
    }

    #[tokio::test]
    async fn test_drain() {
        let (listener, addr) = sink_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = TcpPool::new(4);
        let (mut conn, backend) = pool.get(&addr).await.unwrap();
        conn.flush().await.unwrap();
        pool.put(&backend, conn);
        pool.drain();
        assert_eq!(pool.idle_count(&backend), 0);
    }
}
