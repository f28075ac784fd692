//! The cache manager: owns every resource cache and schedules refreshes.
//!
//! Lifecycle:
//!
//! 1. [`CacheManager::initialize`] validates the configuration and the
//!    name registry, and checks that the cache collection covers every
//!    [`CacheIndex`] in order.
//! 2. [`CacheManager::open_resource_cache`] initializes the requested caches
//!    and marks them scheduled. Caches never requested stay dormant.
//! 3. [`CacheManager::start`] warms every scheduled cache in parallel (each
//!    bounded by the warm-up timeout), then launches one refresh loop per
//!    cache. Warm-up failures fail `start`; refresh-loop failures are logged
//!    and retried on the next tick.
//! 4. [`CacheManager::clear`] and [`CacheManager::close`] fan out to every
//!    scheduled cache, best-effort, aggregating errors.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use meshgov_core::{
    CacheIndex, CacheRegistry, RegistryError, RegistryResult, Revision, RuleKind,
    SharedCacheRegistry, Store,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::base::CacheContext;
use crate::cache::{CacheEntry, ResourceCache, SharedResourceCache};
use crate::config::ManagerConfig;
use crate::instance::InstanceCache;
use crate::namespace::NamespaceCache;
use crate::rule::RuleCache;
use crate::service::ServiceCache;
use crate::shutdown::ShutdownController;
use crate::stats::StatsSnapshot;

/// Owner of every resource cache.
///
/// Typed accessors return concrete cache types, so no caller ever narrows a
/// type-erased handle. The erased collection, in [`CacheIndex`] order,
/// serves the lifecycle fan-out and [`CacheManager::get_cacher`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use meshgov_cache::{CacheEntry, CacheManager, ManagerConfig, MemoryStore, ShutdownController};
/// use meshgov_core::Namespace;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = Arc::new(MemoryStore::new());
/// store.put_namespace(Namespace::new("prod"));
///
/// let manager = CacheManager::new(store, ManagerConfig::default());
/// manager.initialize().unwrap();
/// manager.open_resource_cache(&[CacheEntry::new("namespace")]).unwrap();
///
/// let shutdown = ShutdownController::new();
/// manager.start(&shutdown).await.unwrap();
/// assert!(manager.namespace().get("prod").is_some());
///
/// manager.close().unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct CacheManager {
    config: ManagerConfig,
    registry: SharedCacheRegistry,
    namespace: Arc<NamespaceCache>,
    service: Arc<ServiceCache>,
    instance: Arc<InstanceCache>,
    rules: [Arc<RuleCache>; 5],
    caches: Vec<SharedResourceCache>,
    scheduled: Mutex<BTreeSet<CacheIndex>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CacheManager {
    /// Create a manager with every built-in cache name registered.
    pub fn new(store: Arc<dyn Store>, config: ManagerConfig) -> Self {
        Self::with_registry(store, config, Arc::new(CacheRegistry::with_builtin_caches()))
    }

    /// Create a manager resolving cache names through `registry`.
    pub fn with_registry(
        store: Arc<dyn Store>,
        config: ManagerConfig,
        registry: SharedCacheRegistry,
    ) -> Self {
        let ctx = CacheContext::new(config.mtime_skew(), config.event_buffer);

        let namespace = Arc::new(NamespaceCache::new(Arc::clone(&store), &ctx));
        let service = Arc::new(ServiceCache::new(
            Arc::clone(&store),
            Arc::clone(&namespace),
            &ctx,
        ));
        let instance = Arc::new(InstanceCache::new(Arc::clone(&store), &ctx));
        let rules = RuleKind::ALL.map(|kind| Arc::new(RuleCache::new(kind, Arc::clone(&store), &ctx)));

        let mut caches: Vec<SharedResourceCache> = Vec::with_capacity(CacheIndex::COUNT);
        caches.push(namespace.clone());
        caches.push(service.clone());
        caches.push(instance.clone());
        for rule in &rules {
            caches.push(rule.clone());
        }

        Self {
            config,
            registry,
            namespace,
            service,
            instance,
            rules,
            caches,
            scheduled: Mutex::new(BTreeSet::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Validate configuration, registry and cache collection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] for a non-negative skew
    /// tolerance, a kind without a registered name, or a collection that
    /// does not line up with [`CacheIndex`].
    pub fn initialize(&self) -> RegistryResult<()> {
        self.config.validate()?;
        self.registry.validate()?;

        if self.caches.len() != CacheIndex::COUNT {
            return Err(RegistryError::Configuration(format!(
                "expected {} caches, found {}",
                CacheIndex::COUNT,
                self.caches.len()
            )));
        }
        for (expected, cache) in CacheIndex::ALL.iter().zip(&self.caches) {
            if cache.index() != *expected {
                return Err(RegistryError::Configuration(format!(
                    "cache {} sits at the position of {}",
                    cache.name(),
                    expected
                )));
            }
        }

        info!(
            caches = CacheIndex::COUNT,
            update_interval = ?self.config.update_interval(),
            skew_secs = self.config.mtime_skew_secs,
            "cache manager initialized"
        );
        Ok(())
    }

    /// Initialize and schedule the requested caches.
    ///
    /// Entries naming an unregistered cache are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the first cache's `initialize` error; caches before it stay
    /// scheduled.
    pub fn open_resource_cache(&self, entries: &[CacheEntry]) -> RegistryResult<()> {
        for entry in entries {
            let Some(index) = self.registry.get(&entry.name) else {
                warn!(cache = %entry.name, "ignoring unregistered cache");
                continue;
            };
            self.caches[index.as_usize()].initialize(&entry.options)?;
            self.scheduled
                .lock()
                .expect("scheduled lock poisoned")
                .insert(index);
            debug!(cache = %entry.name, index = %index, "cache opened");
        }
        Ok(())
    }

    /// Warm every scheduled cache, then start the refresh loops.
    ///
    /// The loops run until `shutdown` fires or the manager is closed.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Configuration`] if already started
    /// - the warm-up error of every cache that failed or timed out,
    ///   aggregated; no loop is started in that case
    pub async fn start(&self, shutdown: &ShutdownController) -> RegistryResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::Configuration(
                "cache manager already started".into(),
            ));
        }

        let scheduled = self.scheduled_caches();
        info!(caches = scheduled.len(), "warming up caches");

        let timeout = self.config.warmup_timeout();
        let results = join_all(scheduled.iter().map(|cache| warm_up(cache.as_ref(), timeout))).await;
        let errors: Vec<RegistryError> = results.into_iter().filter_map(Result::err).collect();
        if !errors.is_empty() {
            self.started.store(false, Ordering::SeqCst);
            return RegistryError::aggregate(errors);
        }

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        for cache in &scheduled {
            tasks.push(tokio::spawn(refresh_loop(
                Arc::clone(cache),
                self.config.update_interval(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(report_loop(
            scheduled,
            self.config.report_interval(),
            shutdown.clone(),
        )));

        info!("cache refresh loops started");
        Ok(())
    }

    /// Force a full reset of every scheduled cache.
    ///
    /// # Errors
    ///
    /// Every cache is asked to clear; all failures are aggregated.
    pub fn clear(&self) -> RegistryResult<()> {
        let errors: Vec<RegistryError> = self
            .scheduled_caches()
            .iter()
            .filter_map(|cache| cache.clear().err())
            .collect();
        RegistryError::aggregate(errors)
    }

    /// Stop the refresh loops and close every scheduled cache.
    ///
    /// # Errors
    ///
    /// Every cache is asked to close; all failures are aggregated.
    pub fn close(&self) -> RegistryResult<()> {
        self.abort_tasks();
        let errors: Vec<RegistryError> = self
            .scheduled_caches()
            .iter()
            .filter_map(|cache| cache.close().err())
            .collect();
        info!("cache manager closed");
        RegistryError::aggregate(errors)
    }

    /// Read-after-write refresh of one cache.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotOpened`] for a dormant cache, otherwise
    /// the refresh error.
    pub async fn force_update(&self, index: CacheIndex) -> RegistryResult<()> {
        if !self.is_scheduled(index) {
            return Err(RegistryError::NotOpened {
                cache: index.name().to_string(),
            });
        }
        self.caches[index.as_usize()].force_update().await
    }

    /// Namespace cache.
    pub fn namespace(&self) -> &Arc<NamespaceCache> {
        &self.namespace
    }

    /// Service cache.
    pub fn service(&self) -> &Arc<ServiceCache> {
        &self.service
    }

    /// Instance cache.
    pub fn instance(&self) -> &Arc<InstanceCache> {
        &self.instance
    }

    /// Rule cache of one family.
    pub fn rule(&self, kind: RuleKind) -> &Arc<RuleCache> {
        let offset = kind.cache_index().as_usize() - CacheIndex::RoutingRule.as_usize();
        &self.rules[offset]
    }

    /// Type-erased cache for `index`.
    pub fn get_cacher(&self, index: CacheIndex) -> SharedResourceCache {
        Arc::clone(&self.caches[index.as_usize()])
    }

    /// Every cache, in [`CacheIndex`] order.
    pub fn caches(&self) -> &[SharedResourceCache] {
        &self.caches
    }

    /// Scheduled kinds, in [`CacheIndex`] order.
    pub fn scheduled(&self) -> Vec<CacheIndex> {
        self.scheduled
            .lock()
            .expect("scheduled lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Whether `index` was opened.
    pub fn is_scheduled(&self, index: CacheIndex) -> bool {
        self.scheduled
            .lock()
            .expect("scheduled lock poisoned")
            .contains(&index)
    }

    /// Statistics of one cache.
    pub fn stats(&self, index: CacheIndex) -> StatsSnapshot {
        self.caches[index.as_usize()].stats()
    }

    /// Background refresh period.
    pub fn update_cache_interval(&self) -> Duration {
        self.config.update_interval()
    }

    /// Statistics reporting period.
    pub fn report_interval(&self) -> Duration {
        self.config.report_interval()
    }

    /// The name registry.
    pub fn registry(&self) -> &SharedCacheRegistry {
        &self.registry
    }

    /// The configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Composite discovery revision of a service: its instance-set
    /// revision together with the revision of every service visible from
    /// its namespace.
    ///
    /// The instance and service caches may sit at different watermarks; the
    /// composite only reflects what each cache holds right now.
    pub fn discovery_revision(&self, namespace: &str, service_name: &str) -> Option<Revision> {
        let service = self.service.get_by_name(namespace, service_name)?;
        let own = self.instance.revision_of(&service.id);
        let visible = self.service.visible_services(namespace);

        let parts = std::iter::once(format!("instances:{own}")).chain(
            visible
                .iter()
                .map(|s| format!("service:{}:{}", s.id, s.revision)),
        );
        Some(Revision::compose(parts))
    }

    fn scheduled_caches(&self) -> Vec<SharedResourceCache> {
        self.scheduled()
            .into_iter()
            .map(|index| Arc::clone(&self.caches[index.as_usize()]))
            .collect()
    }

    fn abort_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn warm_up(cache: &dyn ResourceCache, timeout: Duration) -> RegistryResult<()> {
    match tokio::time::timeout(timeout, cache.force_update()).await {
        Ok(Ok(())) => {
            debug!(cache = cache.name(), entries = cache.len(), "warm-up complete");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(cache = cache.name(), error = %e, "warm-up failed");
            Err(e)
        }
        Err(_) => {
            warn!(cache = cache.name(), timeout = ?timeout, "warm-up timed out");
            Err(RegistryError::Timeout {
                operation: format!("warm-up of {}", cache.name()),
            })
        }
    }
}

async fn refresh_loop(cache: SharedResourceCache, period: Duration, shutdown: ShutdownController) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; warm-up already covered it.
    ticker.tick().await;

    let stop = shutdown.signal().wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                debug!(cache = cache.name(), "refresh loop stopped");
                return;
            }
            _ = ticker.tick() => {
                let _op = shutdown.register_operation();
                match cache.update().await {
                    Ok(()) => {}
                    Err(e) if e.is_discarded() => {
                        debug!(cache = cache.name(), "periodic refresh discarded by clear");
                    }
                    Err(e) => {
                        warn!(cache = cache.name(), error = %e, "periodic refresh failed");
                    }
                }
            }
        }
    }
}

async fn report_loop(caches: Vec<SharedResourceCache>, period: Duration, shutdown: ShutdownController) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let stop = shutdown.signal().wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return,
            _ = ticker.tick() => {
                for cache in &caches {
                    let stats = cache.stats();
                    debug!(
                        cache = cache.name(),
                        entries = cache.len(),
                        last_mtime = %cache.watermark().last_mtime(),
                        pulls = stats.pulls,
                        shared = stats.shared,
                        failures = stats.failures,
                        "cache report"
                    );
                }
            }
        }
    }
}
