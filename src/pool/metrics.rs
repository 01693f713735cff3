// ABOUTME: Counters and gauges for one gateway's pools
//
// Tracks:
// - Requests: dispatched, retried, failed
// - Connections: opened, failed to open, currently open

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-gateway metrics, shared by every pool incarnation of that gateway
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub requests_total: AtomicU64,
    pub retries_total: AtomicU64,
    pub failures_total: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connect_failures: AtomicU64,
    pub open_connections: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_dispatched(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_retried(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub retries_total: u64,
    pub failures_total: u64,
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub open_connections: u64,
}
