//! Shared fixtures for the meshgov end-to-end tests.
//!
//! Run with: `cargo test --package integration-tests`

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshgov::prelude::*;
use tracing_subscriber::EnvFilter;

#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod load_tests;
#[cfg(test)]
mod manager_tests;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    /// Cache kind that issued the call.
    pub index: CacheIndex,
    /// Lower bound passed by the cache.
    pub since: DateTime<Utc>,
    /// First-load flag passed by the cache.
    pub first_load: bool,
}

/// Store that records every call before delegating to a [`MemoryStore`].
#[derive(Debug)]
pub struct RecordingStore {
    inner: Arc<MemoryStore>,
    pulls: Mutex<Vec<Pull>>,
}

impl RecordingStore {
    /// Wrap `inner`.
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            pulls: Mutex::new(Vec::new()),
        }
    }

    /// Calls recorded for one kind, in call order.
    pub fn pulls(&self, index: CacheIndex) -> Vec<Pull> {
        self.pulls
            .lock()
            .expect("pull log lock poisoned")
            .iter()
            .filter(|p| p.index == index)
            .cloned()
            .collect()
    }

    fn record(&self, index: CacheIndex, since: DateTime<Utc>, first_load: bool) {
        self.pulls
            .lock()
            .expect("pull log lock poisoned")
            .push(Pull {
                index,
                since,
                first_load,
            });
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn get_more_namespaces(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Namespace>> {
        self.record(CacheIndex::Namespace, since, first_load);
        self.inner.get_more_namespaces(since, first_load).await
    }

    async fn get_more_services(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Service>> {
        self.record(CacheIndex::Service, since, first_load);
        self.inner.get_more_services(since, first_load).await
    }

    async fn get_more_instances(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Instance>> {
        self.record(CacheIndex::Instance, since, first_load);
        self.inner.get_more_instances(since, first_load).await
    }

    async fn get_more_rules(
        &self,
        kind: RuleKind,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Rule>> {
        self.record(kind.cache_index(), since, first_load);
        self.inner.get_more_rules(kind, since, first_load).await
    }
}

/// Every built-in cache name.
pub fn all_entries() -> Vec<CacheEntry> {
    CacheIndex::ALL
        .iter()
        .map(|index| CacheEntry::new(index.name()))
        .collect()
}

/// Initialized manager with `entries` opened, not yet started.
pub fn open_manager(
    store: Arc<dyn Store>,
    config: ManagerConfig,
    entries: &[CacheEntry],
) -> RegistryResult<CacheManager> {
    let manager = CacheManager::new(store, config);
    manager.initialize()?;
    manager.open_resource_cache(entries)?;
    Ok(manager)
}

/// Poll `check` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
