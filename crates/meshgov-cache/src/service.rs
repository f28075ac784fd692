//! Service cache.
//!
//! Keyed by service id, with two derived indexes: `(namespace, name)` to id
//! and namespace to the ids it owns. Cross-namespace visibility combines a
//! service's own `export_to` with the namespace cache's export index.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgov_core::{CacheIndex, RegistryResult, Revision, Service, Store, EXPORT_ALL};
use tracing::debug;

use crate::base::{BaseCache, CacheContext};
use crate::cache::{check_limit, matches_pattern, CacheOptions, Page, ResourceCache, MAX_QUERY_LIMIT};
use crate::events::{CacheEvent, Subscription};
use crate::namespace::NamespaceCache;
use crate::refresh::RefreshOutcome;
use crate::stats::StatsSnapshot;
use crate::watermark::Watermark;

/// Filters for [`ServiceCache::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceArgs {
    /// Owning namespace.
    pub namespace: Option<String>,
    /// Exact name, or a prefix ending in `*`.
    pub name: Option<String>,
    /// Matches to skip.
    pub offset: usize,
    /// Page size, at most [`MAX_QUERY_LIMIT`].
    pub limit: usize,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            namespace: None,
            name: None,
            offset: 0,
            limit: MAX_QUERY_LIMIT,
        }
    }
}

type NameKey = (String, String);

/// In-memory mirror of the service table.
#[derive(Debug)]
pub struct ServiceCache {
    base: BaseCache<Service>,
    store: Arc<dyn Store>,
    namespaces: Arc<NamespaceCache>,
    by_name: DashMap<NameKey, String>,
    by_namespace: DashMap<String, HashSet<String>>,
}

impl ServiceCache {
    /// Create an empty service cache that resolves visibility through
    /// `namespaces`.
    pub fn new(store: Arc<dyn Store>, namespaces: Arc<NamespaceCache>, ctx: &CacheContext) -> Self {
        Self {
            base: BaseCache::new(CacheIndex::Service, ctx),
            store,
            namespaces,
            by_name: DashMap::new(),
            by_namespace: DashMap::new(),
        }
    }

    /// Get a service by id.
    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.base.get(id)
    }

    /// Get a service by namespace and name.
    pub fn get_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        let id = self
            .by_name
            .get(&(namespace.to_string(), name.to_string()))
            .map(|id| id.value().clone())?;
        self.base
            .get(&id)
            .filter(|service| service.namespace == namespace && service.name == name)
    }

    /// Services owned by `namespace`, sorted by name.
    pub fn list_by_namespace(&self, namespace: &str) -> Vec<Arc<Service>> {
        let ids: Vec<String> = self
            .by_namespace
            .get(namespace)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut services: Vec<Arc<Service>> = ids
            .iter()
            .filter_map(|id| self.base.get(id))
            .filter(|service| service.namespace == namespace)
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Every service, sorted by namespace then name.
    pub fn list(&self) -> Vec<Arc<Service>> {
        let mut all = self.base.list();
        sort_services(&mut all);
        all
    }

    /// Whether `viewer` may see `service`.
    pub fn is_visible_to(&self, service: &Service, viewer: &str) -> bool {
        service.namespace == viewer
            || service.export_to.contains(viewer)
            || service.export_to.contains(EXPORT_ALL)
            || self.namespaces.is_visible(viewer, &service.namespace)
    }

    /// Services visible from namespace `viewer`, sorted by namespace then name.
    pub fn visible_services(&self, viewer: &str) -> Vec<Arc<Service>> {
        let mut visible: Vec<Arc<Service>> = self
            .base
            .list()
            .into_iter()
            .filter(|service| self.is_visible_to(service, viewer))
            .collect();
        sort_services(&mut visible);
        visible
    }

    /// Composite revision over every service visible from `viewer`.
    pub fn visible_revision(&self, viewer: &str) -> Revision {
        let visible = self.visible_services(viewer);
        Revision::of_records(visible.iter().map(|s| (s.id.as_str(), s.revision.as_str())))
    }

    /// Filter, sort and page services.
    ///
    /// # Errors
    ///
    /// Returns [`meshgov_core::RegistryError::InvalidArgument`] for a limit
    /// outside `1..=MAX_QUERY_LIMIT`.
    pub fn query(&self, args: &ServiceArgs) -> RegistryResult<Page<Arc<Service>>> {
        check_limit(args.limit)?;

        let candidates = match &args.namespace {
            Some(namespace) => self.list_by_namespace(namespace),
            None => self.base.list(),
        };
        let mut matches: Vec<Arc<Service>> = candidates
            .into_iter()
            .filter(|service| {
                args.name
                    .as_deref()
                    .map_or(true, |pattern| matches_pattern(pattern, &service.name))
            })
            .collect();
        sort_services(&mut matches);

        Ok(Page::slice(matches, args.offset, args.limit))
    }

    /// Subscribe to service events.
    pub fn subscribe(&self) -> Subscription<Service> {
        self.base.subscribe()
    }

    fn apply_index(&self, event: &CacheEvent<Service>) {
        let new = event.new.valid.then_some(&*event.new);

        // Entries shared by the old and new value stay in place.
        if let Some(old) = &event.old {
            let same_name = new.is_some_and(|s| s.namespace == old.namespace && s.name == old.name);
            if !same_name {
                self.by_name
                    .remove_if(&(old.namespace.clone(), old.name.clone()), |_, id| *id == old.id);
            }
            let same_namespace = new.is_some_and(|s| s.namespace == old.namespace);
            if !same_namespace {
                if let Some(mut ids) = self.by_namespace.get_mut(&old.namespace) {
                    ids.remove(&old.id);
                }
                self.by_namespace
                    .remove_if(&old.namespace, |_, ids| ids.is_empty());
            }
        }

        if let Some(service) = new {
            self.by_name.insert(
                (service.namespace.clone(), service.name.clone()),
                service.id.clone(),
            );
            self.by_namespace
                .entry(service.namespace.clone())
                .or_default()
                .insert(service.id.clone());
        }
    }
}

fn sort_services(services: &mut [Arc<Service>]) {
    services.sort_by(|a, b| {
        a.namespace
            .cmp(&b.namespace)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[async_trait]
impl ResourceCache for ServiceCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Service
    }

    fn initialize(&self, options: &CacheOptions) -> RegistryResult<()> {
        debug!(cache = self.name(), options = options.len(), "initialized");
        Ok(())
    }

    async fn run_refresh(&self) -> (RegistryResult<()>, RefreshOutcome) {
        let store = &self.store;
        self.base
            .run(
                move |since, first_load| store.get_more_services(since, first_load),
                |event| self.apply_index(event),
            )
            .await
    }

    fn clear(&self) -> RegistryResult<()> {
        self.base.clear_with(|| {
            self.by_name.clear();
            self.by_namespace.clear();
        });
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
