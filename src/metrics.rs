//! Metrics collection for the consumer coordinator.

use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator metrics collector.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub subscriptions_created: AtomicU64,
    pub subscriptions_closed: AtomicU64,
    pub recoveries_started: AtomicU64,
    pub recoveries_completed: AtomicU64,
    pub consumers_closed_on_stream_deletion: AtomicU64,
    pub clients_created: AtomicU64,
    pub clients_closed: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn record_subscription_created(&self) {
        self.subscriptions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_closed(&self) {
        self.subscriptions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_started(&self) {
        self.recoveries_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_completed(&self) {
        self.recoveries_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumer_closed_on_stream_deletion(&self) {
        self.consumers_closed_on_stream_deletion
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_created(&self) {
        self.clients_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_closed(&self) {
        self.clients_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            subscriptions_created: self.subscriptions_created.load(Ordering::Relaxed),
            subscriptions_closed: self.subscriptions_closed.load(Ordering::Relaxed),
            recoveries_started: self.recoveries_started.load(Ordering::Relaxed),
            recoveries_completed: self.recoveries_completed.load(Ordering::Relaxed),
            consumers_closed_on_stream_deletion: self
                .consumers_closed_on_stream_deletion
                .load(Ordering::Relaxed),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            clients_closed: self.clients_closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CoordinatorMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub subscriptions_created: u64,
    pub subscriptions_closed: u64,
    pub recoveries_started: u64,
    pub recoveries_completed: u64,
    pub consumers_closed_on_stream_deletion: u64,
    pub clients_created: u64,
    pub clients_closed: u64,
}
