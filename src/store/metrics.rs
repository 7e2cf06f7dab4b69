//! Storage metrics for observability.
//!
//! Counters are atomic so every layer can bump them without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the page pool and the node caches.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Pages read from the backing store.
    pub page_loads: AtomicU64,
    /// Pages written to the backing store.
    pub page_stores: AtomicU64,
    /// Node cache lookups served from the cache.
    pub node_hits: AtomicU64,
    /// Node cache lookups that had to load from a stock.
    pub node_misses: AtomicU64,
    /// Nodes evicted from a node cache.
    pub node_evictions: AtomicU64,
    /// Dirty nodes written back to a stock on eviction or flush.
    pub node_write_backs: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_page_loads(&self) {
        self.page_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_page_stores(&self) {
        self.page_stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_hits(&self) {
        self.node_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_misses(&self) {
        self.node_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_evictions(&self) {
        self.node_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_node_write_backs(&self) {
        self.node_write_backs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time view of all counters.
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            page_loads: self.page_loads.load(Ordering::Relaxed),
            page_stores: self.page_stores.load(Ordering::Relaxed),
            node_hits: self.node_hits.load(Ordering::Relaxed),
            node_misses: self.node_misses.load(Ordering::Relaxed),
            node_evictions: self.node_evictions.load(Ordering::Relaxed),
            node_write_backs: self.node_write_backs.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`StoreMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct StoreMetricsSnapshot {
    pub page_loads: u64,
    pub page_stores: u64,
    pub node_hits: u64,
    pub node_misses: u64,
    pub node_evictions: u64,
    pub node_write_backs: u64,
}

impl StoreMetricsSnapshot {
    /// Returns the node cache hit rate (0.0 - 1.0).
    pub fn node_hit_rate(&self) -> f64 {
        let total = self.node_hits + self.node_misses;
        if total == 0 {
            0.0
        } else {
            self.node_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StoreMetrics::new();
        metrics.inc_page_loads();
        metrics.inc_page_loads();
        metrics.inc_node_hits();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.page_loads, 2);
        assert_eq!(snapshot.node_hits, 1);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = StoreMetrics::new();
        metrics.inc_node_hits();
        metrics.inc_node_hits();
        metrics.inc_node_hits();
        metrics.inc_node_misses();
        assert!((metrics.snapshot().node_hit_rate() - 0.75).abs() < 1e-9);
    }
}
