//! Adapter metrics.
//!
//! Counters are shared across connections through an `Arc` and updated with
//! relaxed atomics; increments never block the connection task. Export to a
//! metrics sink is the embedding process's concern.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe metric updates.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for current values.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters covering one adapter's traffic; shared by all its connections.
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    /// Connections currently open.
    pub connections_current: Gauge,
    /// Connections accepted since start.
    pub connections_total: Counter,
    /// Decoded packets accepted from clients.
    pub packets_received: Counter,
    /// Packets written to clients.
    pub packets_written: Counter,
    /// Device publishes relayed to the upstream service.
    pub publishes_to_upstream: Counter,
    /// Upstream messages delivered to devices as PUBLISH.
    pub publishes_to_client: Counter,
    /// Upstream messages rejected for lack of a matching subscription.
    pub messages_rejected: Counter,
    /// Connections torn down by the error funnel.
    pub error_shutdowns: Counter,
}

impl AdapterMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_current: self.connections_current.get(),
            connections_total: self.connections_total.get(),
            packets_received: self.packets_received.get(),
            packets_written: self.packets_written.get(),
            publishes_to_upstream: self.publishes_to_upstream.get(),
            publishes_to_client: self.publishes_to_client.get(),
            messages_rejected: self.messages_rejected.get(),
            error_shutdowns: self.error_shutdowns.get(),
        }
    }
}

/// Point-in-time copy of the counters, for logs and health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_current: u64,
    pub connections_total: u64,
    pub packets_received: u64,
    pub packets_written: u64,
    pub publishes_to_upstream: u64,
    pub publishes_to_client: u64,
    pub messages_rejected: u64,
    pub error_shutdowns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_current_value() {
        let gauge = Gauge::default();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn snapshot_copies_all_counters() {
        let metrics = AdapterMetrics::default();
        metrics.connections_total.inc();
        metrics.packets_received.inc();
        metrics.packets_received.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 1);
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.publishes_to_client, 0);
    }
}
