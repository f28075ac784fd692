//! Namespace cache and the service-visibility index.
//!
//! Besides the authoritative map by name, the cache derives an export
//! index: exporting namespace to the set of viewer namespaces (possibly
//! [`EXPORT_ALL`]) allowed to see its services. The index entry for a
//! namespace is rebuilt whenever that namespace's record changes and
//! removed when the namespace is deleted.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgov_core::{CacheIndex, Namespace, RegistryResult, Store, EXPORT_ALL};
use tracing::debug;

use crate::base::{BaseCache, CacheContext};
use crate::cache::{check_limit, matches_pattern, CacheOptions, Page, ResourceCache, MAX_QUERY_LIMIT};
use crate::events::{CacheEvent, ChangeKind, Subscription};
use crate::refresh::RefreshOutcome;
use crate::stats::StatsSnapshot;
use crate::watermark::Watermark;

/// Filters for [`NamespaceCache::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceArgs {
    /// Exact name, or a prefix ending in `*`.
    pub name: Option<String>,
    /// Required owner.
    pub owner: Option<String>,
    /// Matches to skip.
    pub offset: usize,
    /// Page size, at most [`MAX_QUERY_LIMIT`].
    pub limit: usize,
}

impl Default for NamespaceArgs {
    fn default() -> Self {
        Self {
            name: None,
            owner: None,
            offset: 0,
            limit: MAX_QUERY_LIMIT,
        }
    }
}

/// In-memory mirror of the namespace table.
#[derive(Debug)]
pub struct NamespaceCache {
    base: BaseCache<Namespace>,
    store: Arc<dyn Store>,
    exports: DashMap<String, HashSet<String>>,
}

impl NamespaceCache {
    /// Create an empty namespace cache.
    pub fn new(store: Arc<dyn Store>, ctx: &CacheContext) -> Self {
        Self {
            base: BaseCache::new(CacheIndex::Namespace, ctx),
            store,
            exports: DashMap::new(),
        }
    }

    /// Get a namespace by name.
    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.base.get(name)
    }

    /// Get several namespaces; unknown names are skipped.
    pub fn get_many<I, S>(&self, names: I) -> Vec<Arc<Namespace>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| self.base.get(name.as_ref()))
            .collect()
    }

    /// Get a namespace, forcing a read-after-write refresh if it is missing.
    ///
    /// # Errors
    ///
    /// Propagates the refresh error instead of answering from stale data.
    pub async fn get_consistent(&self, name: &str) -> RegistryResult<Option<Arc<Namespace>>> {
        if let Some(namespace) = self.base.get(name) {
            return Ok(Some(namespace));
        }
        self.force_update().await?;
        Ok(self.base.get(name))
    }

    /// Every namespace, sorted by name.
    pub fn list(&self) -> Vec<Arc<Namespace>> {
        let mut all = self.base.list();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Namespaces whose services `viewer` may see, including itself.
    pub fn visible_namespaces(&self, viewer: &str) -> BTreeSet<String> {
        let mut visible: BTreeSet<String> = self
            .exports
            .iter()
            .filter(|entry| entry.value().contains(viewer) || entry.value().contains(EXPORT_ALL))
            .map(|entry| entry.key().clone())
            .collect();
        visible.insert(viewer.to_string());
        visible
    }

    /// Whether `viewer` may see services exported by `exporter`.
    pub fn is_visible(&self, viewer: &str, exporter: &str) -> bool {
        if viewer == exporter {
            return true;
        }
        self.exports
            .get(exporter)
            .is_some_and(|targets| targets.contains(viewer) || targets.contains(EXPORT_ALL))
    }

    /// Filter, sort (newest first, then by name) and page namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`meshgov_core::RegistryError::InvalidArgument`] for a limit
    /// outside `1..=MAX_QUERY_LIMIT`.
    pub fn query(&self, args: &NamespaceArgs) -> RegistryResult<Page<Arc<Namespace>>> {
        check_limit(args.limit)?;

        let mut matches: Vec<Arc<Namespace>> = self
            .base
            .list()
            .into_iter()
            .filter(|ns| {
                args.name
                    .as_deref()
                    .map_or(true, |pattern| matches_pattern(pattern, &ns.name))
            })
            .filter(|ns| args.owner.as_ref().map_or(true, |owner| ns.owners.contains(owner)))
            .collect();
        matches.sort_by(|a, b| {
            b.modify_time
                .cmp(&a.modify_time)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Page::slice(matches, args.offset, args.limit))
    }

    /// Subscribe to namespace events.
    pub fn subscribe(&self) -> Subscription<Namespace> {
        self.base.subscribe()
    }

    fn apply_index(&self, event: &CacheEvent<Namespace>) {
        let name = &event.new.name;
        match event.kind {
            ChangeKind::Deleted => {
                self.exports.remove(name);
            }
            ChangeKind::Created | ChangeKind::Updated => {
                if event.new.service_export_to.is_empty() {
                    self.exports.remove(name);
                } else {
                    let targets = event.new.service_export_to.iter().cloned().collect();
                    self.exports.insert(name.clone(), targets);
                }
            }
        }
    }
}

#[async_trait]
impl ResourceCache for NamespaceCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Namespace
    }

    fn initialize(&self, options: &CacheOptions) -> RegistryResult<()> {
        debug!(cache = self.name(), options = options.len(), "initialized");
        Ok(())
    }

    async fn run_refresh(&self) -> (RegistryResult<()>, RefreshOutcome) {
        let store = &self.store;
        self.base
            .run(
                move |since, first_load| store.get_more_namespaces(since, first_load),
                |event| self.apply_index(event),
            )
            .await
    }

    fn clear(&self) -> RegistryResult<()> {
        self.base.clear_with(|| self.exports.clear());
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
