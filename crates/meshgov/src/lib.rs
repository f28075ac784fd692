//! # meshgov
//!
//! Incremental cache synchronization for a service-governance control plane.
//!
//! The control plane keeps every registry resource (namespaces, services,
//! instances and five families of governance rules) in a durable store and
//! serves reads from in-memory caches. This crate keeps those caches
//! consistent with the store:
//!
//! - Watermark-based incremental loads with a skew tolerance for
//!   late-committed writes
//! - Single-flight refreshes per cache, with a read-after-write force refresh
//! - Per-kind secondary indexes maintained atomically with the merge
//! - Deterministic composite revisions that let clients skip unchanged
//!   payloads
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use meshgov::prelude::*;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! store.put_namespace(Namespace::new("prod"));
//!
//! let manager = CacheManager::new(store, ManagerConfig::default());
//! manager.initialize()?;
//! manager.open_resource_cache(&[CacheEntry::new("namespace")])?;
//!
//! let shutdown = ShutdownController::new();
//! manager.start(&shutdown).await?;
//! assert!(manager.namespace().get("prod").is_some());
//!
//! shutdown.shutdown(std::time::Duration::from_secs(1)).await;
//! manager.close()?;
//! # Ok::<(), RegistryError>(())
//! # }).unwrap();
//! ```
//!
//! ## Architecture
//!
//! This library is organized into several crates:
//!
//! - `meshgov-core` - Records, the store contract, revisions and errors
//! - `meshgov-cache` - Resource caches, refresh coordination and the manager
//!
//! This crate (`meshgov`) re-exports all public APIs for convenience.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`
//! 2. **No locks held across await points** - Uses DashMap and careful design
//! 3. **Typed caches** - Callers never downcast a type-erased cache
//! 4. **Observable** - Built-in metrics and tracing support

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use meshgov_cache as cache;
pub use meshgov_core as core;

/// Prelude module for convenient imports.
///
/// ```rust
/// use meshgov::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use meshgov_core::{
        CacheIndex, CacheRegistry, Instance, Namespace, Record, RegistryError, RegistryResult,
        Revision, Rule, RuleKind, Service, SharedCacheRegistry, Store, StoreError, StoreResult,
        EXPORT_ALL,
    };

    // Cache types
    pub use meshgov_cache::{
        CacheEntry, CacheEvent, CacheManager, ChangeKind, InstanceCache, ManagerConfig,
        MemoryStore, NamespaceCache, RefreshOutcome, ResourceCache, RuleCache, ServiceCache,
        ShutdownController, StatsSnapshot, Versioned, Watermark,
    };
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!("meshgov {} (MSRV {})", VERSION, MSRV)
    }
}
