//! Stream metrics registry
//!
//! Tracks per-stream byte and error counters plus a process-wide active
//! connection gauge. The registry is the boundary a metrics exporter
//! reads from; [`render`](MetricsRegistry::render) produces the
//! plain-text counter dump (`active_connections`, `bytes_sent_total`,
//! `bytes_received_total`, `errors_total`).
//!
//! Active connections are counted with an RAII [`ActiveGuard`] so the
//! gauge stays accurate on every exit path.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Per-stream counters
#[derive(Debug)]
pub struct StreamMetrics {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub errors: AtomicU64,
    last_active: Mutex<Instant>,
}

impl StreamMetrics {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }
}

/// Process-wide metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    streams: DashMap<String, Arc<StreamMetrics>>,
    active: AtomicI64,
    bytes_sent_total: AtomicU64,
    bytes_received_total: AtomicU64,
    errors_total: AtomicU64,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream by id, creating its counters if absent
    pub fn register_stream(&self, id: &str) -> Arc<StreamMetrics> {
        self.streams
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(StreamMetrics::new()))
            .clone()
    }

    /// Add transferred byte counts for a stream
    pub fn add_bytes(&self, id: &str, sent: u64, received: u64) {
        if let Some(stream) = self.streams.get(id) {
            stream.bytes_sent.fetch_add(sent, Ordering::Relaxed);
            stream.bytes_received.fetch_add(received, Ordering::Relaxed);
            *stream.last_active.lock() = Instant::now();
        }
        self.bytes_sent_total.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received_total.fetch_add(received, Ordering::Relaxed);
    }

    /// Increment a stream's error count
    pub fn add_error(&self, id: &str) {
        if let Some(stream) = self.streams.get(id) {
            stream.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire an RAII guard that holds one active connection
    #[must_use]
    pub fn active_guard(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            registry: Arc::clone(self),
        }
    }

    /// Current active connection count
    #[must_use]
    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Total bytes sent toward clients (monotonic)
    #[must_use]
    pub fn bytes_sent_total(&self) -> u64 {
        self.bytes_sent_total.load(Ordering::Relaxed)
    }

    /// Total bytes received from clients (monotonic)
    #[must_use]
    pub fn bytes_received_total(&self) -> u64 {
        self.bytes_received_total.load(Ordering::Relaxed)
    }

    /// Total per-stream errors (monotonic)
    #[must_use]
    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Drop per-stream entries idle longer than `idle_timeout`
    pub fn cleanup(&self, idle_timeout: Duration) {
        let before = self.streams.len();
        self.streams
            .retain(|_, stream| stream.last_active.lock().elapsed() <= idle_timeout);
        let removed = before.saturating_sub(self.streams.len());
        if removed > 0 {
            debug!(removed, "cleaned up idle stream metrics");
        }
    }

    /// Number of registered streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Render the counters in plain-text exposition format
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "active_connections {}\nbytes_sent_total {}\nbytes_received_total {}\nerrors_total {}\n",
            self.active_connections(),
            self.bytes_sent_total(),
            self.bytes_received_total(),
            self.errors_total(),
        )
    }
}

/// RAII guard decrementing the active connection gauge on drop
#[derive(Debug)]
pub struct ActiveGuard {
    registry: Arc<MetricsRegistry>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_add() {
        let registry = MetricsRegistry::new();
        registry.register_stream("ws-1");
        registry.add_bytes("ws-1", 100, 50);
        registry.add_bytes("ws-1", 10, 5);
        registry.add_error("ws-1");

        let stream = registry.register_stream("ws-1");
        assert_eq!(stream.bytes_sent.load(Ordering::Relaxed), 110);
        assert_eq!(stream.bytes_received.load(Ordering::Relaxed), 55);
        assert_eq!(stream.errors.load(Ordering::Relaxed), 1);
        assert_eq!(registry.bytes_sent_total(), 110);
        assert_eq!(registry.errors_total(), 1);
    }

    #[test]
    fn test_totals_count_unregistered_streams() {
        let registry = MetricsRegistry::new();
        registry.add_bytes("ghost", 7, 3);
        assert_eq!(registry.bytes_sent_total(), 7);
        assert_eq!(registry.bytes_received_total(), 3);
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_active_guard() {
        let registry = Arc::new(MetricsRegistry::new());
        assert_eq!(registry.active_connections(), 0);

        let g1 = registry.active_guard();
        let g2 = registry.active_guard();
        assert_eq!(registry.active_connections(), 2);

        drop(g1);
        assert_eq!(registry.active_connections(), 1);
        drop(g2);
        assert_eq!(registry.active_connections(), 0);
    }

    #[test]
    fn test_cleanup_keeps_fresh_streams() {
        let registry = MetricsRegistry::new();
        registry.register_stream("fresh");
        registry.cleanup(Duration::from_secs(60));
        assert_eq!(registry.stream_count(), 1);

        registry.cleanup(Duration::ZERO);
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_render_contains_counters() {
        let registry = Arc::new(MetricsRegistry::new());
        let _guard = registry.active_guard();
        registry.add_bytes("s", 12, 34);

        let text = registry.render();
        assert!(text.contains("active_connections 1"));
        assert!(text.contains("bytes_sent_total 12"));
        assert!(text.contains("bytes_received_total 34"));
        assert!(text.contains("errors_total 0"));
    }
}
