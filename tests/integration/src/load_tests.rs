//! Load tests for the cache engine with thousands of records.
//!
//! These tests verify the system under high load:
//! - 5000+ instances merged incrementally
//! - Many concurrent refresh callers against one cache
//! - Readers racing the background refresh loop
//!
//! Run with: `cargo test --package integration-tests load_tests -- --nocapture`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshgov::cache::CacheContext;
use meshgov::prelude::*;
use tokio::sync::Barrier;

use crate::{init_tracing, open_manager};

/// The instance cache can absorb 5000 instances over several batches.
#[tokio::test]
async fn load_test_5000_instances() {
    init_tracing();
    const SERVICES: usize = 50;
    const PER_SERVICE: usize = 100;

    let store = Arc::new(MemoryStore::new());
    let cache = InstanceCache::new(store.clone(), &CacheContext::default());

    let start = Instant::now();
    for batch in 0..5 {
        for s in (batch * 10)..((batch + 1) * 10) {
            for i in 0..PER_SERVICE {
                store.put_instance(Instance::new(
                    format!("svc-{s}-inst-{i}"),
                    format!("svc-{s}"),
                    format!("10.{}.{}.1", s, i),
                    8080,
                ));
            }
        }
        cache.update().await.unwrap();
    }
    let elapsed = start.elapsed();

    assert_eq!(cache.len(), SERVICES * PER_SERVICE);
    for s in 0..SERVICES {
        assert_eq!(cache.count_of(&format!("svc-{s}")), PER_SERVICE);
    }
    println!(
        "Merged {} instances in {:?}",
        SERVICES * PER_SERVICE,
        elapsed
    );
    assert_eq!(cache.stats().created, (SERVICES * PER_SERVICE) as u64);
}

/// 200 concurrent callers produce a single store pull.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_test_concurrent_refresh_callers() {
    init_tracing();
    const CALLERS: usize = 200;

    let store = Arc::new(MemoryStore::new());
    for i in 0..100 {
        store.put_namespace(Namespace::new(format!("ns-{i}")));
    }
    store.set_latency(Some(Duration::from_millis(200)));
    let cache = Arc::new(NamespaceCache::new(store.clone(), &CacheContext::default()));
    let barrier = Arc::new(Barrier::new(CALLERS));
    let shared = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let shared = Arc::clone(&shared);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            if cache.refresh().await.unwrap().is_shared() {
                shared.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let pulls = store.pulls(CacheIndex::Namespace);
    println!("{CALLERS} callers, {pulls} pulls");
    // Callers released after the first pull finished may start a second one.
    assert!(pulls <= 2, "expected at most 2 pulls, got {pulls}");
    assert_eq!(store.max_concurrent_pulls(CacheIndex::Namespace), 1);
    assert_eq!(shared.load(Ordering::Relaxed) as usize, CALLERS - pulls);
    assert_eq!(cache.len(), 100);
}

/// Readers observe a consistent entry map and index while the manager
/// refreshes in the background.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_test_readers_race_refresh_loop() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = ManagerConfig::builder()
        .update_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = Arc::new(
        open_manager(store.clone(), config, &[CacheEntry::new("instance")]).unwrap(),
    );
    let shutdown = ShutdownController::new();
    manager.start(&shutdown).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let stop = Arc::clone(&stop);
        let reads = Arc::clone(&reads);
        readers.push(tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                for instance in manager.instance().instances_of("svc") {
                    // Every indexed id resolves to an entry of that service.
                    assert_eq!(instance.service_id, "svc");
                }
                reads.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        }));
    }

    for i in 0..500 {
        store.put_instance(Instance::new(format!("i-{i}"), "svc", "10.0.0.1", 8080));
        if i % 3 == 0 {
            store.put_instance(Instance::new(format!("i-{i}"), "other", "10.0.0.1", 8080));
        }
        if i % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    let last = Instant::now();
    while manager.instance().len() < 500 && last.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.await.unwrap();
    }

    assert_eq!(manager.instance().len(), 500);
    manager.force_update(CacheIndex::Instance).await.unwrap();
    let moved = (0..500).filter(|i| i % 3 == 0).count();
    assert_eq!(manager.instance().count_of("svc"), 500 - moved);
    assert_eq!(manager.instance().count_of("other"), moved);
    println!("{} consistent reads", reads.load(Ordering::Relaxed));

    assert!(shutdown.shutdown(Duration::from_secs(1)).await);
    manager.close().unwrap();
}
