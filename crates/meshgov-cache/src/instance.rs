//! Instance cache and revision-suppressed discovery.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgov_core::{CacheIndex, Instance, RegistryResult, Revision, Store};
use serde::Deserialize;
use tracing::debug;

use crate::base::{BaseCache, CacheContext};
use crate::cache::{parse_options, CacheOptions, ResourceCache, Versioned};
use crate::events::{CacheEvent, Subscription};
use crate::refresh::RefreshOutcome;
use crate::stats::StatsSnapshot;
use crate::watermark::Watermark;

/// Discovery answer for one service.
pub type Discovery = Versioned<Arc<Instance>>;

/// Options accepted by the instance cache.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceOptions {
    /// Leave isolated instances out of discovery results.
    #[serde(default)]
    pub exclude_isolated: bool,
}

/// In-memory mirror of the instance table, indexed by owning service.
#[derive(Debug)]
pub struct InstanceCache {
    base: BaseCache<Instance>,
    store: Arc<dyn Store>,
    by_service: DashMap<String, HashSet<String>>,
    exclude_isolated: AtomicBool,
}

impl InstanceCache {
    /// Create an empty instance cache.
    pub fn new(store: Arc<dyn Store>, ctx: &CacheContext) -> Self {
        Self {
            base: BaseCache::new(CacheIndex::Instance, ctx),
            store,
            by_service: DashMap::new(),
            exclude_isolated: AtomicBool::new(false),
        }
    }

    /// Get an instance by id.
    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.base.get(id)
    }

    /// Instances of a service eligible for discovery, sorted by id.
    pub fn instances_of(&self, service_id: &str) -> Vec<Arc<Instance>> {
        let ids: Vec<String> = match self.by_service.get(service_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let exclude_isolated = self.exclude_isolated.load(Ordering::Relaxed);
        let mut instances: Vec<Arc<Instance>> = ids
            .iter()
            .filter_map(|id| self.base.get(id))
            .filter(|instance| instance.service_id == service_id)
            .filter(|instance| !(exclude_isolated && instance.isolate))
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Number of discoverable instances of a service.
    pub fn count_of(&self, service_id: &str) -> usize {
        self.instances_of(service_id).len()
    }

    /// Revision of a service's discoverable instance set.
    pub fn revision_of(&self, service_id: &str) -> Revision {
        revision_over(&self.instances_of(service_id))
    }

    /// Discovery with change suppression.
    ///
    /// Returns [`Versioned::Unchanged`] when `client_revision` equals the
    /// current instance-set revision.
    pub fn discover(&self, service_id: &str, client_revision: &str) -> Discovery {
        let instances = self.instances_of(service_id);
        let revision = revision_over(&instances);
        Versioned::resolve(revision, client_revision, || instances)
    }

    /// Subscribe to instance events.
    pub fn subscribe(&self) -> Subscription<Instance> {
        self.base.subscribe()
    }

    fn apply_index(&self, event: &CacheEvent<Instance>) {
        let new = event.new.valid.then_some(&*event.new);
        if let Some(old) = &event.old {
            if new.map_or(true, |i| i.service_id != old.service_id) {
                if let Some(mut ids) = self.by_service.get_mut(&old.service_id) {
                    ids.remove(&old.id);
                }
                self.by_service
                    .remove_if(&old.service_id, |_, ids| ids.is_empty());
            }
        }
        if let Some(instance) = new {
            self.by_service
                .entry(instance.service_id.clone())
                .or_default()
                .insert(instance.id.clone());
        }
    }
}

fn revision_over(instances: &[Arc<Instance>]) -> Revision {
    Revision::of_records(instances.iter().map(|i| (i.id.as_str(), i.revision.as_str())))
}

#[async_trait]
impl ResourceCache for InstanceCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Instance
    }

    fn initialize(&self, options: &CacheOptions) -> RegistryResult<()> {
        let options: InstanceOptions = parse_options(self.name(), options)?;
        self.exclude_isolated
            .store(options.exclude_isolated, Ordering::Relaxed);
        debug!(cache = self.name(), exclude_isolated = options.exclude_isolated, "initialized");
        Ok(())
    }

    async fn run_refresh(&self) -> (RegistryResult<()>, RefreshOutcome) {
        let store = &self.store;
        self.base
            .run(
                move |since, first_load| store.get_more_instances(since, first_load),
                |event| self.apply_index(event),
            )
            .await
    }

    fn clear(&self) -> RegistryResult<()> {
        self.base.clear_with(|| self.by_service.clear());
        Ok(())
    }

    fn close(&self) -> RegistryResult<()> {
        self.base.close();
        Ok(())
    }

    fn watermark(&self) -> Watermark {
        self.base.watermark()
    }

    fn is_first_update(&self) -> bool {
        self.base.is_first_update()
    }

    fn len(&self) -> usize {
        self.base.len()
    }

    fn stats(&self) -> StatsSnapshot {
        self.base.stats().snapshot()
    }
}
