//! Governance rule caches.
//!
//! One [`RuleCache`] type backs the five rule families; each instance is
//! bound to a [`RuleKind`] and registered under that kind's cache index.
//! Rules are indexed by target `(namespace, service)`, where a service of
//! [`EXPORT_ALL`] targets every service in the namespace.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshgov_core::{CacheIndex, RegistryResult, Revision, Rule, RuleKind, Store, EXPORT_ALL};
use tracing::debug;

use crate::base::{BaseCache, CacheContext};
use crate::cache::{CacheOptions, ResourceCache, Versioned};
use crate::events::{CacheEvent, Subscription};
use crate::refresh::RefreshOutcome;
use crate::stats::StatsSnapshot;
use crate::watermark::Watermark;

/// Rule fetch answer for one service.
pub type Fetch = Versioned<Arc<Rule>>;

type Target = (String, String);

/// In-memory mirror of one rule family.
#[derive(Debug)]
pub struct RuleCache {
    kind: RuleKind,
    base: BaseCache<Rule>,
    store: Arc<dyn Store>,
    by_target: DashMap<Target, HashSet<String>>,
}

impl RuleCache {
    /// Create an empty cache for rules of `kind`.
    pub fn new(kind: RuleKind, store: Arc<dyn Store>, ctx: &CacheContext) -> Self {
        Self {
            kind,
            base: BaseCache::new(kind.cache_index(), ctx),
            store,
            by_target: DashMap::new(),
        }
    }

    /// Rule family.
    #[inline]
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Get a rule by id.
    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.base.get(id)
    }

    /// Every rule of this family, sorted by id.
    pub fn list(&self) -> Vec<Arc<Rule>> {
        let mut all = self.base.list();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Enabled rules applying to a service, sorted by id.
    ///
    /// Includes rules targeting the whole namespace.
    pub fn rules_for(&self, namespace: &str, service: &str) -> Vec<Arc<Rule>> {
        let mut ids: HashSet<String> = HashSet::new();
        for target in [
            (namespace.to_string(), service.to_string()),
            (namespace.to_string(), EXPORT_ALL.to_string()),
        ] {
            if let Some(found) = self.by_target.get(&target) {
                ids.extend(found.iter().cloned());
            }
        }
        let mut rules: Vec<Arc<Rule>> = ids
            .iter()
            .filter_map(|id| self.base.get(id))
            .filter(|rule| {
                rule.enable
                    && rule.namespace == namespace
                    && (rule.service == service || rule.service == EXPORT_ALL)
            })
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Composite revision over the rules applying to a service.
    pub fn revision_for(&self, namespace: &str, service: &str) -> Revision {
        revision_over(&self.rules_for(namespace, service))
    }

    /// Rule fetch with change suppression.
    pub fn fetch(&self, namespace: &str, service: &str, client_revision: &str) -> Fetch {
        let rules = self.rules_for(namespace, service);
        let revision = revision_over(&rules);
        Versioned::resolve(revision, client_revision, || rules)
    }

    /// Subscribe to this family's events.
    pub fn subscribe(&self) -> Subscription<Rule> {
        self.base.subscribe()
    }

    fn apply_index(&self, event: &CacheEvent<Rule>) {
        let new = event.new.valid.then_some(&*event.new);
        if let Some(old) = &event.old {
            let retargeted = new.map_or(true, |r| {
                r.namespace != old.namespace || r.service != old.service
            });
            if retargeted {
                let old_target = (old.namespace.clone(), old.service.clone());
                if let Some(mut ids) = self.by_target.get_mut(&old_target) {
                    ids.remove(&old.id);
                }
                self.by_target.remove_if(&old_target, |_, ids| ids.is_empty());
            }
        }
        if let Some(rule) = new {
            self.by_target
                .entry((rule.namespace.clone(), rule.service.clone()))
                .or_default()
                .insert(rule.id.clone());
        }
    }
}

fn revision_over(rules: &[Arc<Rule>]) -> Revision {
    Revision::of_records(rules.iter().map(|r| (r.id.as_str(), r.revision.as_str())))
}

#[async_trait]
impl ResourceCache for RuleCache {
    fn index(&self) -> CacheIndex {
        self.kind.cache_index()
    }

    fn initialize(&self, options: &CacheOptions) -> RegistryResult<()> {
        debug!(cache = self.name(), options = options.len(), "initialized");
        Ok(())
    }

    async fn run_refresh(&self) -> (RegistryResult<()>, RefreshOutcome) {
        let store = &self.store;
        let kind = self.kind;
        self.base
            .run(
                move |since, first_load| store.get_more_rules(kind, since, first_load),
                |event| self.apply_index(event),
            )
            .await
    }

    fn clear(&self) -> RegistryResult<()> {
        self.base.clear_with(|| self.by_target.clear());
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
