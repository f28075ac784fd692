//! Prometheus-style metrics for resource caches.
//!
//! Every metric carries a `cache` label with the cache name:
//!
//! - `meshgov_cache_refresh_total` - pulls led
//! - `meshgov_cache_refresh_shared_total` - refreshes that joined a pull
//! - `meshgov_cache_refresh_failures_total` - failed pulls
//! - `meshgov_cache_records_merged_total` - merged records, labelled by change
//! - `meshgov_cache_refresh_latency_ms` - pull latency
//! - `meshgov_cache_entries` - live entries

use std::time::Instant;

use metrics::{counter, gauge, histogram};

use crate::events::ChangeKind;

/// Metric recorder bound to one cache name.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    cache: &'static str,
}

impl CacheMetrics {
    /// Create a recorder for `cache`.
    pub fn new(cache: &'static str) -> Self {
        Self { cache }
    }

    /// Record a pull led by this cache.
    pub fn refresh_started(&self) -> RefreshTimer {
        counter!("meshgov_cache_refresh_total", "cache" => self.cache).increment(1);
        RefreshTimer {
            start: Instant::now(),
            cache: self.cache,
        }
    }

    /// Record a refresh that joined an in-flight pull.
    pub fn refresh_shared(&self) {
        counter!("meshgov_cache_refresh_shared_total", "cache" => self.cache).increment(1);
    }

    /// Record a failed pull.
    pub fn refresh_failed(&self) {
        counter!("meshgov_cache_refresh_failures_total", "cache" => self.cache).increment(1);
    }

    /// Record merged records of one change kind.
    pub fn records_merged(&self, kind: ChangeKind, count: u64) {
        if count == 0 {
            return;
        }
        counter!(
            "meshgov_cache_records_merged_total",
            "cache" => self.cache,
            "change" => kind.to_string()
        )
        .increment(count);
    }

    /// Publish the live entry count.
    pub fn entries(&self, count: usize) {
        gauge!("meshgov_cache_entries", "cache" => self.cache).set(count as f64);
    }
}

/// Measures one pull; records latency when finished.
#[derive(Debug)]
pub struct RefreshTimer {
    start: Instant,
    cache: &'static str,
}

impl RefreshTimer {
    /// Finish the timer and record the latency.
    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        histogram!("meshgov_cache_refresh_latency_ms", "cache" => self.cache)
            .record(elapsed.as_secs_f64() * 1_000.0);
    }
}
