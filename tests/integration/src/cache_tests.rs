//! Cache integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use meshgov::cache::CacheContext;
use meshgov::prelude::*;

use crate::{init_tracing, RecordingStore};

fn namespaces(store: &Arc<MemoryStore>) -> Arc<NamespaceCache> {
    Arc::new(NamespaceCache::new(store.clone(), &CacheContext::default()))
}

#[tokio::test]
async fn namespace_lifecycle_emits_events_and_advances_watermark() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = namespaces(&store);
    let mut events = cache.subscribe();

    let written = store.put_namespace(Namespace::new("ns1"));
    cache.update().await.expect("first load");

    let created = events.recv().await.expect("created event");
    assert_eq!(created.kind, ChangeKind::Created);
    assert!(created.old.is_none());
    assert_eq!(created.new.name, "ns1");
    assert_eq!(cache.watermark().last_mtime(), written.modify_time);
    assert!(!cache.is_first_update());

    assert!(store.delete_namespace("ns1"));
    cache.update().await.expect("incremental load");

    let deleted = events.recv().await.expect("deleted event");
    assert_eq!(deleted.kind, ChangeKind::Deleted);
    assert_eq!(deleted.old.as_ref().map(|ns| ns.name.as_str()), Some("ns1"));
    assert!(cache.get("ns1").is_none());

    let tombstone = store.namespace("ns1").expect("soft-deleted row");
    assert_eq!(cache.watermark().last_mtime(), tombstone.modify_time);
}

#[tokio::test]
async fn concurrent_updates_share_one_pull() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_namespace(Namespace::new("ns1"));
    store.set_latency(Some(Duration::from_millis(100)));
    let cache = namespaces(&store);

    let results = join_all((0..16).map(|_| cache.refresh())).await;

    let led = results
        .iter()
        .filter(|r| matches!(r, Ok(RefreshOutcome::Led)))
        .count();
    let shared = results
        .iter()
        .filter(|r| matches!(r, Ok(RefreshOutcome::Shared)))
        .count();
    assert_eq!(led, 1);
    assert_eq!(shared, 15);
    assert_eq!(store.pulls(CacheIndex::Namespace), 1);
    assert_eq!(store.max_concurrent_pulls(CacheIndex::Namespace), 1);
    assert_eq!(cache.stats().shared, 15);
}

#[tokio::test]
async fn force_update_during_in_flight_pull_sees_new_write() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.set_latency(Some(Duration::from_millis(150)));
    let cache = namespaces(&store);

    let background = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.update().await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    // The in-flight pull already selected its rows.
    store.put_namespace(Namespace::new("late"));
    cache.force_update().await.expect("force update");

    assert!(cache.get("late").is_some());
    background.await.expect("join").expect("background update");
    assert_eq!(store.pulls(CacheIndex::Namespace), 2);
    assert_eq!(store.max_concurrent_pulls(CacheIndex::Namespace), 1);
}

#[tokio::test]
async fn late_commit_within_skew_is_picked_up() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = namespaces(&store);

    let first = store.put_namespace(Namespace::new("first"));
    cache.update().await.unwrap();
    let high = first.modify_time;

    // Committed after the pull, stamped before the watermark.
    store.put_raw_namespace(
        Namespace::new("lagging")
            .at(high - TimeDelta::seconds(3))
            .with_revision("r-lagging"),
    );
    store.put_raw_namespace(
        Namespace::new("ancient")
            .at(high - TimeDelta::seconds(30))
            .with_revision("r-ancient"),
    );
    cache.update().await.unwrap();

    assert!(cache.get("lagging").is_some());
    assert!(cache.get("ancient").is_none());
    assert_eq!(cache.watermark().last_mtime(), high);
}

#[tokio::test]
async fn since_is_watermark_plus_skew() {
    init_tracing();
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(memory.clone()));
    let cache = NamespaceCache::new(store.clone(), &CacheContext::new(TimeDelta::seconds(-5), 16));

    let written = memory.put_namespace(Namespace::new("ns1"));
    cache.update().await.unwrap();
    cache.update().await.unwrap();

    let pulls = store.pulls(CacheIndex::Namespace);
    assert_eq!(pulls.len(), 2);
    assert!(pulls[0].first_load);
    assert_eq!(pulls[0].since, DateTime::<Utc>::UNIX_EPOCH);
    assert!(!pulls[1].first_load);
    assert_eq!(pulls[1].since, written.modify_time - TimeDelta::seconds(5));
}

#[tokio::test]
async fn re_merging_overlap_is_idempotent() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = namespaces(&store);
    store.put_namespace(Namespace::new("a"));
    store.put_namespace(Namespace::new("b"));
    cache.update().await.unwrap();

    let before = cache.get("a").unwrap();
    let mut events = cache.subscribe();

    // Both rows fall inside the skew window and are pulled again.
    cache.update().await.unwrap();
    cache.update().await.unwrap();

    assert!(Arc::ptr_eq(&before, &cache.get("a").unwrap()));
    assert!(events.drain().is_empty());
    assert_eq!(cache.len(), 2);
    assert!(cache.stats().unchanged >= 4);
}

#[tokio::test]
async fn deleted_rows_are_skipped_on_first_load() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_namespace(Namespace::new("live"));
    store.put_namespace(Namespace::new("gone"));
    store.delete_namespace("gone");

    let cache = namespaces(&store);
    let mut events = cache.subscribe();
    cache.update().await.unwrap();

    let kinds: Vec<ChangeKind> = events.drain().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Created]);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn clear_then_reload_rebuilds_indexes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let ns = namespaces(&store);
    let services = ServiceCache::new(store.clone(), ns.clone(), &CacheContext::default());

    store.put_service(Service::new("s1", "prod", "checkout"));
    services.update().await.unwrap();
    assert!(services.get_by_name("prod", "checkout").is_some());

    services.clear().unwrap();
    assert!(services.get_by_name("prod", "checkout").is_none());
    assert!(services.list_by_namespace("prod").is_empty());
    assert!(services.is_first_update());

    services.update().await.unwrap();
    assert_eq!(services.list_by_namespace("prod").len(), 1);
}

#[tokio::test]
async fn service_rename_moves_name_index() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let ns = namespaces(&store);
    let services = ServiceCache::new(store.clone(), ns, &CacheContext::default());

    store.put_service(Service::new("s1", "prod", "checkout"));
    services.update().await.unwrap();
    store.put_service(Service::new("s1", "prod", "payments"));
    services.update().await.unwrap();

    assert!(services.get_by_name("prod", "checkout").is_none());
    assert_eq!(
        services.get_by_name("prod", "payments").map(|s| s.id.clone()),
        Some("s1".to_string())
    );
    assert_eq!(services.list_by_namespace("prod").len(), 1);
}

#[tokio::test]
async fn namespace_export_controls_service_visibility() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let ns = namespaces(&store);
    let services = ServiceCache::new(store.clone(), ns.clone(), &CacheContext::default());

    store.put_namespace(Namespace::new("infra").with_export_to(["prod"]));
    store.put_namespace(Namespace::new("prod"));
    store.put_service(Service::new("dns", "infra", "dns"));
    store.put_service(Service::new("db", "staging", "db"));
    ns.update().await.unwrap();
    services.update().await.unwrap();

    let visible: Vec<String> = services
        .visible_services("prod")
        .iter()
        .map(|s| s.id.clone())
        .collect();
    assert_eq!(visible, vec!["dns"]);
    let revision = services.visible_revision("prod");

    store.put_namespace(Namespace::new("infra"));
    ns.update().await.unwrap();
    assert!(services.visible_services("prod").is_empty());
    assert_ne!(services.visible_revision("prod"), revision);
}

#[tokio::test]
async fn rule_fetch_follows_incremental_changes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let rules = RuleCache::new(RuleKind::CircuitBreaker, store.clone(), &CacheContext::default());

    store.put_rule(Rule::new("cb1", RuleKind::CircuitBreaker, "prod", "checkout"));
    // Rules of other families never reach this cache.
    store.put_rule(Rule::new("rl1", RuleKind::RateLimit, "prod", "checkout"));
    rules.update().await.unwrap();

    let first = rules.fetch("prod", "checkout", "");
    assert_eq!(first.items().map(<[_]>::len), Some(1));
    let revision = first.revision().clone();
    assert!(rules.fetch("prod", "checkout", revision.as_str()).is_unchanged());

    store.delete_rule(RuleKind::CircuitBreaker, "cb1");
    rules.update().await.unwrap();
    let after = rules.fetch("prod", "checkout", revision.as_str());
    assert!(!after.is_unchanged());
    assert_eq!(after.items().map(<[_]>::len), Some(0));
}

#[tokio::test]
async fn store_failure_leaves_cache_serving() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = namespaces(&store);
    store.put_namespace(Namespace::new("ns1"));
    cache.update().await.unwrap();
    let watermark = cache.watermark();

    store.fail_with(Some("connection reset"));
    store.put_namespace(Namespace::new("ns2"));
    let err = cache.update().await.unwrap_err();
    assert!(err.is_store());
    assert!(cache.get("ns1").is_some());
    assert_eq!(cache.watermark(), watermark);

    store.fail_with(None);
    cache.update().await.unwrap();
    assert!(cache.get("ns2").is_some());
}
