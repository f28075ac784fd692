//! Cache manager lifecycle tests.

use std::sync::Arc;
use std::time::Duration;

use meshgov::prelude::*;

use crate::{all_entries, init_tracing, open_manager, wait_until};

fn fast_config() -> ManagerConfig {
    ManagerConfig::builder()
        .update_interval(Duration::from_millis(20))
        .report_interval(Duration::from_millis(50))
        .warmup_timeout(Duration::from_secs(2))
        .build()
        .expect("valid config")
}

#[tokio::test]
async fn manager_full_lifecycle() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_namespace(Namespace::new("prod"));
    store.put_service(Service::new("s1", "prod", "checkout"));
    store.put_instance(Instance::new("i1", "s1", "10.0.0.1", 8080));
    for kind in RuleKind::ALL {
        store.put_rule(Rule::new(format!("{kind}-1"), kind, "prod", "checkout"));
    }

    let manager = open_manager(store.clone(), fast_config(), &all_entries()).unwrap();
    let shutdown = ShutdownController::new();
    manager.start(&shutdown).await.unwrap();

    // Warm-up loaded every scheduled cache before start returned.
    assert_eq!(manager.scheduled().len(), CacheIndex::COUNT);
    for index in CacheIndex::ALL {
        let cache = manager.get_cacher(index);
        assert_eq!(cache.len(), 1, "{index} warmed up");
        assert!(!cache.is_first_update());
    }
    for kind in RuleKind::ALL {
        assert_eq!(manager.rule(kind).rules_for("prod", "checkout").len(), 1);
    }

    // Background refresh picks up later writes.
    store.put_instance(Instance::new("i2", "s1", "10.0.0.2", 8080));
    let instance = Arc::clone(manager.instance());
    assert!(wait_until(Duration::from_secs(2), || instance.count_of("s1") == 2).await);

    assert!(shutdown.shutdown(Duration::from_secs(1)).await);
    manager.close().unwrap();
    for cache in manager.caches() {
        assert!(cache.force_update().await.is_err());
    }
}

#[tokio::test]
async fn manager_warm_up_failure_reports_every_cache() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.fail_with(Some("primary unreachable"));

    let manager = open_manager(store.clone(), fast_config(), &all_entries()).unwrap();
    let err = manager.start(&ShutdownController::new()).await.unwrap_err();

    match err {
        RegistryError::Multiple(errors) => {
            assert_eq!(errors.len(), CacheIndex::COUNT);
            assert!(errors.iter().all(RegistryError::is_store));
        }
        other => panic!("expected aggregated errors, got {other}"),
    }

    // A failed start may be retried once the store recovers.
    store.fail_with(None);
    manager.start(&ShutdownController::new()).await.unwrap();
    manager.close().unwrap();
}

#[tokio::test]
async fn manager_periodic_failures_are_swallowed() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let manager = open_manager(
        store.clone(),
        fast_config(),
        &[CacheEntry::new("namespace")],
    )
    .unwrap();
    let shutdown = ShutdownController::new();
    manager.start(&shutdown).await.unwrap();

    store.fail_with(Some("flapping"));
    let namespace = Arc::clone(manager.namespace());
    assert!(
        wait_until(Duration::from_secs(2), || {
            namespace.stats().failures >= 2
        })
        .await
    );

    // The loops keep running and recover without intervention.
    store.fail_with(None);
    store.put_namespace(Namespace::new("recovered"));
    assert!(wait_until(Duration::from_secs(2), || namespace.get("recovered").is_some()).await);

    assert!(shutdown.shutdown(Duration::from_secs(1)).await);
    manager.close().unwrap();
}

#[tokio::test]
async fn manager_shutdown_stops_refresh_loops() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let manager = open_manager(
        store.clone(),
        fast_config(),
        &[CacheEntry::new("service")],
    )
    .unwrap();
    let shutdown = ShutdownController::new();
    manager.start(&shutdown).await.unwrap();

    assert!(shutdown.shutdown(Duration::from_secs(1)).await);
    // Let any loop that observed the signal exit.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let pulls = store.pulls(CacheIndex::Service);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.pulls(CacheIndex::Service), pulls);
    manager.close().unwrap();
}

#[tokio::test]
async fn manager_options_reach_the_cache() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_instance(Instance::new("i1", "s1", "10.0.0.1", 80));
    store.put_instance(Instance::new("i2", "s1", "10.0.0.2", 80).isolated());

    let entries = [CacheEntry::new("instance").with_option("exclude_isolated", true)];
    let manager = open_manager(store, fast_config(), &entries).unwrap();
    manager.start(&ShutdownController::new()).await.unwrap();

    assert_eq!(manager.instance().count_of("s1"), 1);
    manager.close().unwrap();
}

#[tokio::test]
async fn manager_rejects_bad_options() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let entries = [CacheEntry::new("instance").with_option("exclude_isolated", "yes")];
    let err = open_manager(store, fast_config(), &entries).unwrap_err();
    assert!(matches!(err, RegistryError::Configuration(_)));
}

#[tokio::test]
async fn manager_custom_registry_aliases() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_namespace(Namespace::new("prod"));

    let mut registry = CacheRegistry::with_builtin_caches();
    registry.register("tenants", CacheIndex::Namespace);
    let manager = CacheManager::with_registry(store, fast_config(), Arc::new(registry));
    manager.initialize().unwrap();
    manager
        .open_resource_cache(&[CacheEntry::new("tenants")])
        .unwrap();
    manager.start(&ShutdownController::new()).await.unwrap();

    assert_eq!(manager.scheduled(), vec![CacheIndex::Namespace]);
    assert!(manager.namespace().get("prod").is_some());
    manager.close().unwrap();
}

#[tokio::test]
async fn manager_discovery_revision_is_stable_without_changes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.put_service(Service::new("s1", "prod", "checkout"));
    store.put_instance(Instance::new("i1", "s1", "10.0.0.1", 80));

    let manager = open_manager(store, fast_config(), &all_entries()).unwrap();
    manager.start(&ShutdownController::new()).await.unwrap();

    let first = manager.discovery_revision("prod", "checkout").unwrap();
    manager.force_update(CacheIndex::Instance).await.unwrap();
    manager.force_update(CacheIndex::Service).await.unwrap();
    assert_eq!(manager.discovery_revision("prod", "checkout").unwrap(), first);
    manager.close().unwrap();
}
