//! Generic incremental cache engine shared by every resource cache.
//!
//! [`BaseCache`] owns the authoritative map, the watermark, the event hub
//! and the statistics for one resource kind. Concrete caches supply the
//! store call and a hook that maintains their secondary indexes; the pull,
//! validation, merge and watermark advance live here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use meshgov_core::{CacheIndex, Record, RegistryError, RegistryResult, StoreResult};
use tracing::{debug, trace, warn};

use crate::events::{CacheEvent, ChangeKind, EventHub, Subscription};
use crate::metrics::CacheMetrics;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::stats::RefreshStats;
use crate::watermark::Watermark;

/// Shared construction context handed to every cache by the manager.
#[derive(Debug, Clone)]
pub struct CacheContext {
    /// Coordinator shared by every cache in the process.
    pub coordinator: Arc<RefreshCoordinator>,
    /// Backward offset applied to the watermark before each pull.
    pub skew: TimeDelta,
    /// Per-subscriber event channel depth.
    pub event_buffer: usize,
}

impl CacheContext {
    /// Create a context with a fresh coordinator.
    pub fn new(skew: TimeDelta, event_buffer: usize) -> Self {
        Self {
            coordinator: Arc::new(RefreshCoordinator::new()),
            skew,
            event_buffer,
        }
    }
}

impl Default for CacheContext {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(-5), 64)
    }
}

/// Per-pull merge tally.
#[derive(Debug, Default, Clone, Copy)]
struct MergeSummary {
    created: u64,
    updated: u64,
    deleted: u64,
    unchanged: u64,
    max_mtime: Option<DateTime<Utc>>,
}

impl MergeSummary {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => self.created += 1,
            ChangeKind::Updated => self.updated += 1,
            ChangeKind::Deleted => self.deleted += 1,
        }
    }
}

/// Progress state guarded by one lock.
///
/// Merges, watermark updates and clears all take this lock, so a clear can
/// never interleave with the middle of a batch.
#[derive(Debug)]
struct SyncState {
    watermark: Watermark,
    first_update: bool,
    generation: u64,
}

/// The incremental cache engine for records of type `R`.
#[derive(Debug)]
pub struct BaseCache<R: Record> {
    index: CacheIndex,
    entries: DashMap<String, Arc<R>>,
    state: Mutex<SyncState>,
    skew: TimeDelta,
    coordinator: Arc<RefreshCoordinator>,
    events: EventHub<R>,
    stats: RefreshStats,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl<R: Record> BaseCache<R> {
    /// Create an empty cache for `index`.
    pub fn new(index: CacheIndex, ctx: &CacheContext) -> Self {
        Self {
            index,
            entries: DashMap::new(),
            state: Mutex::new(SyncState {
                watermark: Watermark::zero(),
                first_update: true,
                generation: 0,
            }),
            skew: ctx.skew,
            coordinator: Arc::clone(&ctx.coordinator),
            events: EventHub::new(index.name(), ctx.event_buffer),
            stats: RefreshStats::new(),
            metrics: CacheMetrics::new(index.name()),
            closed: AtomicBool::new(false),
        }
    }

    /// Resource kind.
    #[inline]
    pub fn index(&self) -> CacheIndex {
        self.index
    }

    /// Cache name, also the coordinator key and the event topic.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.index.name()
    }

    /// Get an entry by key.
    pub fn get(&self, key: &str) -> Option<Arc<R>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.record_hit();
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Every entry, in no particular order.
    pub fn list(&self) -> Vec<Arc<R>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current watermark.
    pub fn watermark(&self) -> Watermark {
        self.state.lock().expect("cache state lock poisoned").watermark
    }

    /// Whether the next pull is a first load.
    pub fn is_first_update(&self) -> bool {
        self.state.lock().expect("cache state lock poisoned").first_update
    }

    /// Statistics.
    pub fn stats(&self) -> &RefreshStats {
        &self.stats
    }

    /// Subscribe to this cache's events.
    pub fn subscribe(&self) -> Subscription<R> {
        self.events.subscribe()
    }

    /// Event hub of this cache.
    pub fn events(&self) -> &EventHub<R> {
        &self.events
    }

    /// Whether [`BaseCache::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refresh through the coordinator, joining any pull already in flight.
    ///
    /// `fetch` performs the store call for `(since, first_load)`;
    /// `on_change` runs for every classified record before its event is
    /// published, and is where secondary indexes are maintained.
    pub async fn refresh<F, Fut, C>(&self, fetch: F, on_change: C) -> RegistryResult<RefreshOutcome>
    where
        F: Fn(DateTime<Utc>, bool) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<Vec<R>>> + Send,
        C: Fn(&CacheEvent<R>) + Send + Sync,
    {
        let (result, outcome) = self.run(fetch, on_change).await;
        result.map(|()| outcome)
    }

    /// Like [`BaseCache::refresh`], but the outcome is reported even when
    /// the pull failed.
    pub async fn run<F, Fut, C>(&self, fetch: F, on_change: C) -> (RegistryResult<()>, RefreshOutcome)
    where
        F: Fn(DateTime<Utc>, bool) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<Vec<R>>> + Send,
        C: Fn(&CacheEvent<R>) + Send + Sync,
    {
        let (result, outcome) = self
            .coordinator
            .run(self.name(), || self.pull(&fetch, &on_change))
            .await;
        if outcome.is_shared() {
            self.stats.record_shared();
            self.metrics.refresh_shared();
        }
        (result, outcome)
    }

    async fn pull<F, Fut, C>(&self, fetch: &F, on_change: &C) -> RegistryResult<()>
    where
        F: Fn(DateTime<Utc>, bool) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<Vec<R>>> + Send,
        C: Fn(&CacheEvent<R>) + Send + Sync,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (since, first_load, generation) = {
            let state = self.state.lock().expect("cache state lock poisoned");
            (state.watermark.since(self.skew), state.first_update, state.generation)
        };
        self.stats.record_pull();
        let timer = self.metrics.refresh_started();
        let fetched_at = Utc::now();

        trace!(cache = self.name(), since = %since, first_load, "pulling from store");
        let records = match fetch(since, first_load).await {
            Ok(records) => records,
            Err(e) => {
                self.stats.record_failure();
                self.metrics.refresh_failed();
                timer.finish();
                warn!(cache = self.name(), error = %e, "store pull failed");
                return Err(RegistryError::store(self.name(), e));
            }
        };

        if let Err(err) = self.validate(&records) {
            self.stats.record_failure();
            self.metrics.refresh_failed();
            timer.finish();
            warn!(cache = self.name(), error = %err, "rejecting batch");
            return Err(err);
        }

        let mut state = self.state.lock().expect("cache state lock poisoned");
        if self.is_closed() {
            timer.finish();
            return Err(self.closed_error());
        }
        if state.generation != generation {
            // Cleared while the store call was running; the batch belongs to
            // the discarded state.
            timer.finish();
            debug!(cache = self.name(), "cache cleared during pull, discarding batch");
            return Err(RegistryError::RefreshDiscarded {
                cache: self.name().to_string(),
            });
        }

        let count = records.len();
        let summary = self.merge(records, on_change);
        state.watermark.advance(summary.max_mtime, fetched_at);
        state.first_update = false;
        let last_mtime = state.watermark.last_mtime();
        drop(state);

        self.metrics.records_merged(ChangeKind::Created, summary.created);
        self.metrics.records_merged(ChangeKind::Updated, summary.updated);
        self.metrics.records_merged(ChangeKind::Deleted, summary.deleted);
        self.metrics.entries(self.entries.len());
        timer.finish();

        if count > 0 {
            debug!(
                cache = self.name(),
                records = count,
                created = summary.created,
                updated = summary.updated,
                deleted = summary.deleted,
                unchanged = summary.unchanged,
                last_mtime = %last_mtime,
                "merged batch"
            );
        }
        Ok(())
    }

    /// Reject the whole batch if any record is malformed.
    fn validate(&self, records: &[R]) -> RegistryResult<()> {
        for record in records {
            if let Err(reason) = record.check() {
                return Err(RegistryError::InvalidRecord {
                    cache: self.name().to_string(),
                    key: record.key().to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Apply a validated batch. Caller holds the state lock.
    fn merge<C>(&self, records: Vec<R>, on_change: &C) -> MergeSummary
    where
        C: Fn(&CacheEvent<R>),
    {
        let mut summary = MergeSummary::default();

        // Within one batch the latest version of a key wins.
        let mut latest: HashMap<String, R> = HashMap::with_capacity(records.len());
        for record in records {
            let mtime = record.modify_time();
            summary.max_mtime = Some(summary.max_mtime.map_or(mtime, |max| max.max(mtime)));
            match latest.get(record.key()) {
                Some(seen) if seen.modify_time() > mtime => {}
                _ => {
                    latest.insert(record.key().to_string(), record);
                }
            }
        }

        let mut batch: Vec<R> = latest.into_values().collect();
        batch.sort_by(|a, b| {
            a.modify_time()
                .cmp(&b.modify_time())
                .then_with(|| a.key().cmp(b.key()))
        });

        for record in batch {
            let key = record.key().to_string();
            let old = self.entries.get(&key).map(|entry| Arc::clone(entry.value()));

            let kind = if record.is_valid() {
                if let Some(existing) = &old {
                    if is_same_version(existing.as_ref(), &record) {
                        summary.unchanged += 1;
                        self.stats.record_unchanged();
                        continue;
                    }
                }
                let kind = if old.is_some() {
                    ChangeKind::Updated
                } else {
                    ChangeKind::Created
                };
                let new = Arc::new(record);
                self.entries.insert(key, Arc::clone(&new));
                self.emit(kind, old, new, on_change);
                kind
            } else {
                let Some(old) = old else {
                    continue;
                };
                self.entries.remove(&key);
                self.emit(ChangeKind::Deleted, Some(old), Arc::new(record), on_change);
                ChangeKind::Deleted
            };

            summary.count(kind);
            self.stats.record_change(kind);
        }

        summary
    }

    fn emit<C>(&self, kind: ChangeKind, old: Option<Arc<R>>, new: Arc<R>, on_change: &C)
    where
        C: Fn(&CacheEvent<R>),
    {
        let event = CacheEvent { kind, old, new };
        on_change(&event);
        self.events.publish(event);
    }

    /// Discard every entry and reset the watermark.
    ///
    /// The next pull becomes a first load. A pull in flight at the time of
    /// the clear discards its batch and fails with
    /// [`RegistryError::RefreshDiscarded`].
    pub fn clear(&self) {
        self.clear_with(|| {});
    }

    /// Like [`BaseCache::clear`], also resetting secondary indexes while no
    /// merge can run.
    pub fn clear_with<F: FnOnce()>(&self, reset_indexes: F) {
        let mut state = self.state.lock().expect("cache state lock poisoned");
        self.entries.clear();
        reset_indexes();
        state.watermark.reset();
        state.first_update = true;
        state.generation += 1;
        drop(state);

        self.coordinator.forget(self.name());
        self.metrics.entries(0);
        debug!(cache = self.name(), "cleared");
    }

    /// Stop accepting refreshes and end every subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.events.close();
        debug!(cache = self.name(), "closed");
    }

    fn closed_error(&self) -> RegistryError {
        RegistryError::Closed {
            cache: self.name().to_string(),
        }
    }
}

fn is_same_version<R: Record>(existing: &R, incoming: &R) -> bool {
    existing.modify_time() == incoming.modify_time() && existing.revision() == incoming.revision()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgov_core::{Namespace, StoreError};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn cache() -> BaseCache<Namespace> {
        BaseCache::new(CacheIndex::Namespace, &CacheContext::default())
    }

    fn batch(
        records: Vec<Namespace>,
    ) -> impl Fn(DateTime<Utc>, bool) -> futures::future::Ready<StoreResult<Vec<Namespace>>> + Send + Sync
    {
        move |_, _| futures::future::ready(Ok(records.clone()))
    }

    fn no_index(_: &CacheEvent<Namespace>) {}

    #[tokio::test]
    async fn base_cache_created_then_deleted() {
        let cache = cache();
        let mut sub = cache.subscribe();

        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(100))]), no_index)
            .await
            .unwrap();
        assert!(cache.get("ns1").is_some());
        assert_eq!(cache.watermark().last_mtime(), ts(100));
        assert!(!cache.is_first_update());

        let created = sub.try_recv().unwrap();
        assert_eq!(created.kind, ChangeKind::Created);
        assert!(created.old.is_none());

        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(200)).deleted()]), no_index)
            .await
            .unwrap();
        assert!(cache.get("ns1").is_none());
        assert_eq!(cache.watermark().last_mtime(), ts(200));

        let deleted = sub.try_recv().unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.old.unwrap().modify_time(), ts(100));
    }

    #[tokio::test]
    async fn base_cache_delete_of_unknown_key_is_noop() {
        let cache = cache();
        let mut sub = cache.subscribe();
        cache
            .refresh(batch(vec![Namespace::new("ghost").at(ts(50)).deleted()]), no_index)
            .await
            .unwrap();
        assert!(cache.is_empty());
        assert!(sub.try_recv().is_err());
        // Watermark still covers the processed record.
        assert_eq!(cache.watermark().last_mtime(), ts(50));
    }

    #[tokio::test]
    async fn base_cache_unchanged_records_are_skipped() {
        let cache = cache();
        let mut sub = cache.subscribe();
        let records = vec![Namespace::new("ns1").at(ts(100)).with_revision("r1")];

        cache.refresh(batch(records.clone()), no_index).await.unwrap();
        let before = cache.get("ns1").unwrap();
        cache.refresh(batch(records), no_index).await.unwrap();
        let after = cache.get("ns1").unwrap();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(sub.drain().len(), 1);
        assert_eq!(cache.stats().snapshot().unchanged, 1);
    }

    #[tokio::test]
    async fn base_cache_updated_carries_old_value() {
        let cache = cache();
        let mut sub = cache.subscribe();
        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(1)).with_revision("r1")]), no_index)
            .await
            .unwrap();
        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(2)).with_revision("r2")]), no_index)
            .await
            .unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, ChangeKind::Updated);
        assert_eq!(events[1].old.as_ref().unwrap().revision(), "r1");
        assert_eq!(events[1].new.revision(), "r2");
    }

    #[tokio::test]
    async fn base_cache_latest_version_in_batch_wins() {
        let cache = cache();
        let records = vec![
            Namespace::new("ns1").at(ts(20)).deleted(),
            Namespace::new("ns1").at(ts(10)),
        ];
        cache.refresh(batch(records), no_index).await.unwrap();
        assert!(cache.get("ns1").is_none());
        assert_eq!(cache.watermark().last_mtime(), ts(20));
    }

    #[tokio::test]
    async fn base_cache_store_error_keeps_state() {
        let cache = cache();
        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(100))]), no_index)
            .await
            .unwrap();

        let failing = |_: DateTime<Utc>, _: bool| {
            futures::future::ready(Err::<Vec<Namespace>, _>(StoreError::Unavailable(
                "down".into(),
            )))
        };
        let err = cache.refresh(failing, no_index).await.unwrap_err();
        assert!(err.is_store());
        assert!(err.to_string().contains("namespace"));
        assert!(cache.get("ns1").is_some());
        assert_eq!(cache.watermark().last_mtime(), ts(100));
        assert_eq!(cache.stats().failures(), 1);
    }

    #[tokio::test]
    async fn base_cache_invalid_record_rejects_whole_batch() {
        let cache = cache();
        let mut sub = cache.subscribe();
        let records = vec![Namespace::new("good").at(ts(10)), Namespace::new("").at(ts(20))];

        let err = cache.refresh(batch(records), no_index).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { .. }));
        assert!(cache.is_empty());
        assert!(cache.watermark().is_zero());
        assert!(cache.is_first_update());
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn base_cache_passes_skewed_since() {
        let cache = cache();
        let seen: Mutex<Vec<(DateTime<Utc>, bool)>> = Mutex::new(Vec::new());
        let fetch = |since: DateTime<Utc>, first: bool| {
            seen.lock().unwrap().push((since, first));
            futures::future::ready(Ok(vec![Namespace::new("ns1").at(ts(100))]))
        };

        cache.refresh(&fetch, no_index).await.unwrap();
        cache.refresh(&fetch, no_index).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (DateTime::UNIX_EPOCH, true));
        assert_eq!(seen[1], (ts(95), false));
    }

    #[tokio::test]
    async fn base_cache_on_change_runs_before_publish() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        cache
            .refresh(
                batch(vec![Namespace::new("a").at(ts(1)), Namespace::new("b").at(ts(2))]),
                |event: &CacheEvent<Namespace>| {
                    assert_eq!(event.kind, ChangeKind::Created);
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn base_cache_clear_resets_to_first_load() {
        let cache = cache();
        cache
            .refresh(batch(vec![Namespace::new("ns1").at(ts(100))]), no_index)
            .await
            .unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.watermark().is_zero());
        assert!(cache.is_first_update());
    }

    #[tokio::test]
    async fn base_cache_clear_discards_in_flight_batch() {
        let cache = Arc::new(cache());
        let pulling = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .refresh(
                        |_, _| async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(vec![Namespace::new("stale").at(ts(10))])
                        },
                        no_index,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.clear();

        let err = pulling.await.unwrap().unwrap_err();
        assert!(err.is_discarded());
        assert!(cache.get("stale").is_none());
        assert!(cache.is_first_update());
    }

    #[tokio::test]
    async fn base_cache_closed_rejects_refresh() {
        let cache = cache();
        let mut sub = cache.subscribe();
        cache.close();
        let err = cache.refresh(batch(vec![]), no_index).await.unwrap_err();
        assert!(matches!(err, RegistryError::Closed { .. }));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn base_cache_concurrent_refreshes_pull_once() {
        let cache = cache();
        let pulls = AtomicUsize::new(0);
        let fetch = |_: DateTime<Utc>, _: bool| {
            pulls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(vec![Namespace::new("ns1").at(ts(1))])
            }
        };

        let (a, b) = tokio::join!(cache.refresh(&fetch, no_index), cache.refresh(&fetch, no_index));
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), RefreshOutcome::Led);
        assert_eq!(b.unwrap(), RefreshOutcome::Shared);
        assert_eq!(cache.stats().snapshot().shared, 1);
    }
}
