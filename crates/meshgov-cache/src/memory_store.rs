//! In-memory [`Store`] for tests, benches and embedded use.
//!
//! Writes are stamped from a controllable clock that moves forward one
//! second per write, and deletes are soft: the row stays with
//! `valid == false` and a fresh modify timestamp. Pull latency and failures
//! can be injected, and every pull is counted per resource kind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use meshgov_core::{
    CacheIndex, Instance, Namespace, Record, Revision, Rule, RuleKind, Service, Store, StoreError,
    StoreResult,
};
use tracing::trace;

/// Default starting point of the store clock (2023-11-14T22:13:20Z).
const DEFAULT_EPOCH_SECS: i64 = 1_700_000_000;

#[derive(Debug)]
struct Table<R> {
    rows: Mutex<BTreeMap<String, R>>,
    pulls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl<R: Record> Table<R> {
    fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            pulls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn upsert(&self, record: R) {
        self.rows
            .lock()
            .expect("store table lock poisoned")
            .insert(record.key().to_string(), record);
    }

    fn soft_delete(&self, key: &str, mtime: DateTime<Utc>) -> bool {
        let mut rows = self.rows.lock().expect("store table lock poisoned");
        match rows.get_mut(key) {
            Some(row) if row.is_valid() => {
                row.set_valid(false);
                row.set_modify_time(mtime);
                true
            }
            _ => false,
        }
    }

    fn get(&self, key: &str) -> Option<R> {
        self.rows
            .lock()
            .expect("store table lock poisoned")
            .get(key)
            .cloned()
    }

    fn select(&self, since: DateTime<Utc>, first_load: bool) -> Vec<R> {
        let rows = self.rows.lock().expect("store table lock poisoned");
        let mut selected: Vec<R> = rows
            .values()
            .filter(|row| row.modify_time() >= since)
            .filter(|row| !first_load || row.is_valid())
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            a.modify_time()
                .cmp(&b.modify_time())
                .then_with(|| a.key().cmp(b.key()))
        });
        selected
    }

    fn enter(&self) -> PullGuard<'_> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        PullGuard {
            in_flight: &self.in_flight,
        }
    }

    fn reset_counters(&self) {
        self.pulls.store(0, Ordering::SeqCst);
        self.max_in_flight.store(0, Ordering::SeqCst);
    }
}

struct PullGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Thread-safe in-memory store.
///
/// # Example
///
/// ```rust
/// use meshgov_cache::MemoryStore;
/// use meshgov_core::{Namespace, Record};
///
/// let store = MemoryStore::new();
/// let first = store.put_namespace(Namespace::new("prod"));
/// let second = store.put_namespace(Namespace::new("dev"));
/// assert!(second.modify_time() > first.modify_time());
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    clock: Mutex<DateTime<Utc>>,
    latency: Mutex<Option<Duration>>,
    failure: Mutex<Option<String>>,
    next_failure: Mutex<Option<String>>,
    namespaces: Table<Namespace>,
    services: Table<Service>,
    instances: Table<Instance>,
    rules: [Table<Rule>; 5],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store whose clock starts at a fixed instant.
    pub fn new() -> Self {
        let start = DateTime::from_timestamp(DEFAULT_EPOCH_SECS, 0).unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            clock: Mutex::new(start),
            latency: Mutex::new(None),
            failure: Mutex::new(None),
            next_failure: Mutex::new(None),
            namespaces: Table::new(),
            services: Table::new(),
            instances: Table::new(),
            rules: [
                Table::new(),
                Table::new(),
                Table::new(),
                Table::new(),
                Table::new(),
            ],
        }
    }

    /// Current store clock.
    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock().expect("store clock lock poisoned")
    }

    /// Set the store clock.
    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.clock.lock().expect("store clock lock poisoned") = now;
    }

    /// Move the store clock by `delta` (may be negative).
    pub fn advance(&self, delta: TimeDelta) {
        let mut clock = self.clock.lock().expect("store clock lock poisoned");
        if let Some(next) = clock.checked_add_signed(delta) {
            *clock = next;
        }
    }

    /// Delay every pull by `latency`.
    ///
    /// Rows are selected before the delay, so a write landing while a slow
    /// pull sleeps is not part of that pull.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().expect("store latency lock poisoned") = latency;
    }

    /// Make every pull fail with `message`, or succeed again with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().expect("store failure lock poisoned") = message.map(str::to_string);
    }

    /// Make only the next pull fail with `message`, after its latency.
    pub fn fail_next(&self, message: &str) {
        *self.next_failure.lock().expect("store failure lock poisoned") = Some(message.to_string());
    }

    /// Pulls served for a resource kind.
    pub fn pulls(&self, index: CacheIndex) -> usize {
        self.counter(index, |pulls, _| pulls.load(Ordering::SeqCst))
    }

    /// Largest number of simultaneous pulls seen for a resource kind.
    pub fn max_concurrent_pulls(&self, index: CacheIndex) -> usize {
        self.counter(index, |_, max| max.load(Ordering::SeqCst))
    }

    /// Reset pull counters for every kind.
    pub fn reset_pull_counters(&self) {
        self.namespaces.reset_counters();
        self.services.reset_counters();
        self.instances.reset_counters();
        for table in &self.rules {
            table.reset_counters();
        }
    }

    /// Insert or replace a namespace, stamping time, revision and validity.
    pub fn put_namespace(&self, namespace: Namespace) -> Namespace {
        let stamped = self.stamp(namespace);
        self.namespaces.upsert(stamped.clone());
        stamped
    }

    /// Store a namespace exactly as given.
    pub fn put_raw_namespace(&self, namespace: Namespace) {
        self.namespaces.upsert(namespace);
    }

    /// Soft-delete a namespace. Returns `false` if no live row existed.
    pub fn delete_namespace(&self, name: &str) -> bool {
        let mtime = self.tick();
        self.namespaces.soft_delete(name, mtime)
    }

    /// Current row for a namespace, deleted or not.
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.get(name)
    }

    /// Insert or replace a service.
    pub fn put_service(&self, service: Service) -> Service {
        let stamped = self.stamp(service);
        self.services.upsert(stamped.clone());
        stamped
    }

    /// Store a service exactly as given.
    pub fn put_raw_service(&self, service: Service) {
        self.services.upsert(service);
    }

    /// Soft-delete a service.
    pub fn delete_service(&self, id: &str) -> bool {
        let mtime = self.tick();
        self.services.soft_delete(id, mtime)
    }

    /// Insert or replace an instance.
    pub fn put_instance(&self, instance: Instance) -> Instance {
        let stamped = self.stamp(instance);
        self.instances.upsert(stamped.clone());
        stamped
    }

    /// Store an instance exactly as given.
    pub fn put_raw_instance(&self, instance: Instance) {
        self.instances.upsert(instance);
    }

    /// Soft-delete an instance.
    pub fn delete_instance(&self, id: &str) -> bool {
        let mtime = self.tick();
        self.instances.soft_delete(id, mtime)
    }

    /// Insert or replace a rule.
    pub fn put_rule(&self, rule: Rule) -> Rule {
        let stamped = self.stamp(rule);
        self.rule_table(stamped.kind).upsert(stamped.clone());
        stamped
    }

    /// Store a rule exactly as given.
    pub fn put_raw_rule(&self, rule: Rule) {
        self.rule_table(rule.kind).upsert(rule);
    }

    /// Soft-delete a rule.
    pub fn delete_rule(&self, kind: RuleKind, id: &str) -> bool {
        let mtime = self.tick();
        self.rule_table(kind).soft_delete(id, mtime)
    }

    fn stamp<R: Record + StampRevision>(&self, mut record: R) -> R {
        let mtime = self.tick();
        record.set_modify_time(mtime);
        record.set_valid(true);
        let revision = Revision::compose([record.key(), &mtime.timestamp_micros().to_string()]);
        record.stamp_revision(revision.into_inner());
        record
    }

    /// Current clock value; the clock then moves one second forward.
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().expect("store clock lock poisoned");
        let now = *clock;
        *clock = now + TimeDelta::seconds(1);
        now
    }

    fn rule_table(&self, kind: RuleKind) -> &Table<Rule> {
        let pos = RuleKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        &self.rules[pos]
    }

    fn counter<T>(&self, index: CacheIndex, read: impl Fn(&AtomicUsize, &AtomicUsize) -> T) -> T {
        match index {
            CacheIndex::Namespace => read(&self.namespaces.pulls, &self.namespaces.max_in_flight),
            CacheIndex::Service => read(&self.services.pulls, &self.services.max_in_flight),
            CacheIndex::Instance => read(&self.instances.pulls, &self.instances.max_in_flight),
            CacheIndex::RoutingRule => self.rule_counter(RuleKind::Routing, read),
            CacheIndex::RateLimitRule => self.rule_counter(RuleKind::RateLimit, read),
            CacheIndex::CircuitBreakerRule => self.rule_counter(RuleKind::CircuitBreaker, read),
            CacheIndex::FaultDetectRule => self.rule_counter(RuleKind::FaultDetect, read),
            CacheIndex::LaneRule => self.rule_counter(RuleKind::Lane, read),
        }
    }

    fn rule_counter<T>(&self, kind: RuleKind, read: impl Fn(&AtomicUsize, &AtomicUsize) -> T) -> T {
        let table = self.rule_table(kind);
        read(&table.pulls, &table.max_in_flight)
    }

    async fn pull<R: Record>(
        &self,
        table: &Table<R>,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<R>> {
        let _guard = table.enter();
        let failure = self
            .failure
            .lock()
            .expect("store failure lock poisoned")
            .clone();
        if let Some(message) = failure {
            return Err(StoreError::Unavailable(message));
        }

        let next_failure = self
            .next_failure
            .lock()
            .expect("store failure lock poisoned")
            .take();

        let rows = table.select(since, first_load);
        let latency = *self.latency.lock().expect("store latency lock poisoned");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = next_failure {
            return Err(StoreError::Unavailable(message));
        }
        trace!(since = %since, first_load, rows = rows.len(), "served pull");
        Ok(rows)
    }
}

/// Revision stamping for rows written through [`MemoryStore`].
trait StampRevision {
    fn stamp_revision(&mut self, revision: String);
}

macro_rules! impl_stamp_revision {
    ($($ty:ty),*) => {
        $(impl StampRevision for $ty {
            fn stamp_revision(&mut self, revision: String) {
                self.revision = revision;
            }
        })*
    };
}

impl_stamp_revision!(Namespace, Service, Instance, Rule);

#[async_trait]
impl Store for MemoryStore {
    async fn get_more_namespaces(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Namespace>> {
        self.pull(&self.namespaces, since, first_load).await
    }

    async fn get_more_services(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Service>> {
        self.pull(&self.services, since, first_load).await
    }

    async fn get_more_instances(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Instance>> {
        self.pull(&self.instances, since, first_load).await
    }

    async fn get_more_rules(
        &self,
        kind: RuleKind,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Rule>> {
        self.pull(self.rule_table(kind), since, first_load).await
    }
}
