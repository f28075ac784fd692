//! Per-cache refresh statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::ChangeKind;

/// Statistics for one resource cache.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct RefreshStats {
    /// Store pulls this cache led.
    pulls: AtomicU64,
    /// Refreshes satisfied by joining another caller's pull.
    shared: AtomicU64,
    /// Pulls that ended in an error.
    failures: AtomicU64,
    /// Records merged as new entries.
    created: AtomicU64,
    /// Records that replaced an entry.
    updated: AtomicU64,
    /// Records that removed an entry.
    deleted: AtomicU64,
    /// Records identical to the cached entry.
    unchanged: AtomicU64,
    /// Point reads that found an entry.
    hits: AtomicU64,
    /// Point reads that found nothing.
    misses: AtomicU64,
}

/// Point-in-time copy of [`RefreshStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Store pulls led.
    pub pulls: u64,
    /// Shared refreshes.
    pub shared: u64,
    /// Failed pulls.
    pub failures: u64,
    /// Created entries.
    pub created: u64,
    /// Updated entries.
    pub updated: u64,
    /// Deleted entries.
    pub deleted: u64,
    /// Unchanged records.
    pub unchanged: u64,
    /// Read hits.
    pub hits: u64,
    /// Read misses.
    pub misses: u64,
}

impl RefreshStats {
    /// Create new statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pull led by this cache.
    #[inline]
    pub fn record_pull(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refresh that joined an in-flight pull.
    #[inline]
    pub fn record_shared(&self) {
        self.shared.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed pull.
    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one merged record.
    #[inline]
    pub fn record_change(&self, kind: ChangeKind) {
        let counter = match kind {
            ChangeKind::Created => &self.created,
            ChangeKind::Updated => &self.updated,
            ChangeKind::Deleted => &self.deleted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record that matched the cached entry.
    #[inline]
    pub fn record_unchanged(&self) {
        self.unchanged.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read hit.
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read miss.
    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total pulls led.
    #[inline]
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    /// Get total failed pulls.
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pulls: self.pulls.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Calculate read hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        for counter in [
            &self.pulls,
            &self.shared,
            &self.failures,
            &self.created,
            &self.updated,
            &self.deleted,
            &self.unchanged,
            &self.hits,
            &self.misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
