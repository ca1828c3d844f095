use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use webterm_common::poison_recovery_count;

use crate::events::EventSink;
use crate::session::SessionId;

/// Process-wide counters fed by session and connection events.
pub struct DaemonMetrics {
    sessions_created: AtomicU64,
    sessions_terminated: AtomicU64,
    sessions_failed: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    errors_total: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_terminated: u64,
    pub sessions_failed: u64,
    pub connections_opened: u64,
    pub connections_active: u64,
    pub errors_total: u64,
    pub poison_recoveries: u64,
    pub uptime_ms: u64,
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonMetrics {
    pub fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sessions_terminated: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created(),
            sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed(),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_active: self.active_connections(),
            errors_total: self.errors(),
            poison_recoveries: poison_recovery_count(),
            uptime_ms: self.uptime_ms(),
        }
    }
}

impl EventSink for DaemonMetrics {
    fn session_created(&self, id: &SessionId) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %id, "Session created");
    }

    fn session_terminated(&self, id: &SessionId) {
        self.sessions_terminated.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %id, "Session terminated");
    }

    fn session_failed(&self, id: &SessionId, message: &str) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        warn!(session_id = %id, error = message, "Session failed");
    }

    fn connection_opened(&self, id: &SessionId) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, "Client connected");
    }

    fn connection_closed(&self, id: &SessionId) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, "Client disconnected");
    }

    fn error_recorded(&self, _code: &'static str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_values() {
        let metrics = DaemonMetrics::new();
        assert_eq!(metrics.sessions_created(), 0);
        assert_eq!(metrics.errors(), 0);
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn test_connection_gauge_tracks_open_minus_closed() {
        let metrics = DaemonMetrics::new();
        let id = SessionId::generate();
        metrics.connection_opened(&id);
        metrics.connection_opened(&id);
        metrics.connection_closed(&id);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = DaemonMetrics::new();
        metrics.session_created(&SessionId::generate());
        metrics.error_recorded("PTY_IO_FAILED");
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["sessions_created"], 1);
        assert_eq!(json["errors_total"], 1);
    }
}
