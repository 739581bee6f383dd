//! Process-wide pipeline counters.
//!
//! Plain atomics shared by `Arc`; the server renders them as Prometheus
//! text. Saturation events (rejected promotions, dropped documents, dropped
//! fan-out messages) are counters here first and log lines second, so
//! bounded degradation is always observable.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub edits_processed: AtomicU64,
    pub promotions: AtomicU64,
    pub promotion_rejected: AtomicU64,
    /// Gauge: hot pages currently tracked (updated by the cleanup pass).
    pub hot_pages: AtomicU64,
    pub cleanup_removed: AtomicU64,
    pub spike_alerts: AtomicU64,
    pub editwar_alerts: AtomicU64,
    pub trending_pruned: AtomicU64,
    pub trending_evicted: AtomicU64,
    pub docs_indexed: AtomicU64,
    /// Documents dropped because the indexer buffer was full.
    pub docs_dropped: AtomicU64,
    pub bulk_failures: AtomicU64,
    pub breaker_opens: AtomicU64,
    pub poison_messages: AtomicU64,
    pub handler_retries: AtomicU64,
    pub consumer_restarts: AtomicU64,
    pub hub_delivered: AtomicU64,
    /// Fan-out messages dropped on a full subscriber channel.
    pub hub_dropped: AtomicU64,
}

/// Point-in-time copy of every counter, for `/metrics` and tests.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub edits_processed: u64,
    pub promotions: u64,
    pub promotion_rejected: u64,
    pub hot_pages: u64,
    pub cleanup_removed: u64,
    pub spike_alerts: u64,
    pub editwar_alerts: u64,
    pub trending_pruned: u64,
    pub trending_evicted: u64,
    pub docs_indexed: u64,
    pub docs_dropped: u64,
    pub bulk_failures: u64,
    pub breaker_opens: u64,
    pub poison_messages: u64,
    pub handler_retries: u64,
    pub consumer_restarts: u64,
    pub hub_delivered: u64,
    pub hub_dropped: u64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_gauge(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            edits_processed: self.edits_processed.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotion_rejected: self.promotion_rejected.load(Ordering::Relaxed),
            hot_pages: self.hot_pages.load(Ordering::Relaxed),
            cleanup_removed: self.cleanup_removed.load(Ordering::Relaxed),
            spike_alerts: self.spike_alerts.load(Ordering::Relaxed),
            editwar_alerts: self.editwar_alerts.load(Ordering::Relaxed),
            trending_pruned: self.trending_pruned.load(Ordering::Relaxed),
            trending_evicted: self.trending_evicted.load(Ordering::Relaxed),
            docs_indexed: self.docs_indexed.load(Ordering::Relaxed),
            docs_dropped: self.docs_dropped.load(Ordering::Relaxed),
            bulk_failures: self.bulk_failures.load(Ordering::Relaxed),
            breaker_opens: self.breaker_opens.load(Ordering::Relaxed),
            poison_messages: self.poison_messages.load(Ordering::Relaxed),
            handler_retries: self.handler_retries.load(Ordering::Relaxed),
            consumer_restarts: self.consumer_restarts.load(Ordering::Relaxed),
            hub_delivered: self.hub_delivered.load(Ordering::Relaxed),
            hub_dropped: self.hub_dropped.load(Ordering::Relaxed),
        }
    }
}
