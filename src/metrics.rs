//! Per-store metrics.
//!
//! Thread-safe atomic counters for the commit pipeline, compaction, zone
//! rotation and the page cache. `snapshot()` copies them into a plain
//! serializable struct.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreMetrics {
    commits: AtomicU64,
    commit_failures: AtomicU64,
    pages_written: AtomicU64,
    bytes_written: AtomicU64,
    compactions: AtomicU64,
    compactions_skipped: AtomicU64,
    pages_rewritten: AtomicU64,
    zone_shifts: AtomicU64,
    zones_retired: AtomicU64,
    page_cache_hits: AtomicU64,
    page_cache_misses: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Commit pipeline
    pub commits: u64,
    pub commit_failures: u64,
    pub pages_written: u64,
    pub bytes_written: u64,

    // Compaction
    pub compactions: u64,
    pub compactions_skipped: u64,
    pub pages_rewritten: u64,

    // Zones
    pub zone_shifts: u64,
    pub zones_retired: u64,

    // Page cache
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.page_cache_hits + self.page_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.page_cache_hits as f64 / total as f64
        }
    }

    pub fn avg_chunk_pages(&self) -> f64 {
        if self.commits == 0 {
            0.0
        } else {
            self.pages_written as f64 / self.commits as f64
        }
    }
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- commit -----
    pub fn record_commit(&self, pages: u64, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.pages_written.fetch_add(pages, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    // ----- compaction -----
    pub fn record_compaction(&self, rewritten: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.pages_rewritten.fetch_add(rewritten, Ordering::Relaxed);
    }

    pub fn record_compaction_skipped(&self) {
        self.compactions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    // ----- zones -----
    pub fn record_zone_shift(&self) {
        self.zone_shifts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zone_retired(&self) {
        self.zones_retired.fetch_add(1, Ordering::Relaxed);
    }

    // ----- page cache -----
    pub fn record_cache_hit(&self) {
        self.page_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.page_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compactions_skipped: self.compactions_skipped.load(Ordering::Relaxed),
            pages_rewritten: self.pages_rewritten.load(Ordering::Relaxed),
            zone_shifts: self.zone_shifts.load(Ordering::Relaxed),
            zones_retired: self.zones_retired.load(Ordering::Relaxed),
            page_cache_hits: self.page_cache_hits.load(Ordering::Relaxed),
            page_cache_misses: self.page_cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters (useful in tests and benchmarks).
    pub fn reset(&self) {
        for c in [
            &self.commits,
            &self.commit_failures,
            &self.pages_written,
            &self.bytes_written,
            &self.compactions,
            &self.compactions_skipped,
            &self.pages_rewritten,
            &self.zone_shifts,
            &self.zones_retired,
            &self.page_cache_hits,
            &self.page_cache_misses,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_and_reset() {
        let m = StoreMetrics::new();
        assert_eq!(m.snapshot().cache_hit_ratio(), 0.0);
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_hit();
        m.record_cache_miss();
        assert!((m.snapshot().cache_hit_ratio() - 0.75).abs() < 1e-9);
        m.record_commit(4, 1000);
        assert_eq!(m.snapshot().avg_chunk_pages(), 4.0);
        m.reset();
        assert_eq!(m.snapshot().commits, 0);
        assert_eq!(m.snapshot().page_cache_hits, 0);
    }
}
