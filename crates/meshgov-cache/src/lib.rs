//! # meshgov-cache
//!
//! Incremental in-memory caches for the service-governance control plane.
//!
//! This crate keeps a local mirror of every registry resource kind in sync
//! with the durable store:
//!
//! - [`CacheManager`] - Owns every cache, warms them up and schedules
//!   background refreshes
//! - [`ResourceCache`] - Lifecycle contract every cache implements
//! - [`NamespaceCache`], [`ServiceCache`], [`InstanceCache`], [`RuleCache`] -
//!   Typed caches with secondary indexes and revision-suppressed reads
//! - [`RefreshCoordinator`] - At most one in-flight store pull per cache
//! - [`EventHub`] - Per-cache change notifications
//!
//! ## Key Design Decisions
//!
//! - Each refresh pulls only rows modified since the watermark minus a
//!   fixed skew tolerance, so late-committed writes are never skipped
//! - Concurrent refreshes of one cache share a single pull; a forced
//!   refresh never returns a pull that started before it was called
//! - Secondary indexes are updated under the same lock as the merge, so
//!   readers never see an index ahead of or behind the entry map
//! - `DashMap` references are never held across an `.await`
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use meshgov_cache::{CacheEntry, CacheManager, ManagerConfig, MemoryStore, ShutdownController};
//! use meshgov_core::{CacheIndex, Instance, Service};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! store.put_service(Service::new("s1", "prod", "checkout"));
//! store.put_instance(Instance::new("i1", "s1", "10.0.0.1", 8080));
//!
//! let manager = CacheManager::new(store.clone(), ManagerConfig::default());
//! manager.initialize().unwrap();
//! manager
//!     .open_resource_cache(&[CacheEntry::new("service"), CacheEntry::new("instance")])
//!     .unwrap();
//! manager.start(&ShutdownController::new()).await.unwrap();
//!
//! let first = manager.instance().discover("s1", "");
//! assert_eq!(first.items().unwrap().len(), 1);
//!
//! // Read-after-write: the forced refresh observes the new instance.
//! store.put_instance(Instance::new("i2", "s1", "10.0.0.2", 8080));
//! manager.force_update(CacheIndex::Instance).await.unwrap();
//! assert_eq!(manager.instance().count_of("s1"), 2);
//!
//! manager.close().unwrap();
//! # });
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod base;
mod cache;
mod config;
mod events;
mod instance;
mod manager;
mod memory_store;
mod metrics;
mod namespace;
mod refresh;
mod rule;
mod service;
mod shutdown;
mod stats;
mod watermark;

pub use base::{BaseCache, CacheContext};
pub use cache::{
    CacheEntry, CacheOptions, Page, ResourceCache, SharedResourceCache, Versioned,
    MAX_QUERY_LIMIT,
};
pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use events::{CacheEvent, ChangeKind, EventHub, Subscription, SubscriptionId};
pub use instance::{Discovery, InstanceCache, InstanceOptions};
pub use manager::CacheManager;
pub use memory_store::MemoryStore;
pub use metrics::{CacheMetrics, RefreshTimer};
pub use namespace::{NamespaceArgs, NamespaceCache};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use rule::{Fetch, RuleCache};
pub use service::{ServiceArgs, ServiceCache};
pub use shutdown::{OperationGuard, ShutdownController, ShutdownSignal};
pub use stats::{RefreshStats, StatsSnapshot};
pub use watermark::Watermark;
