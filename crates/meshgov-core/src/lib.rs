//! # meshgov-core
//!
//! Core types, traits, and error handling for the meshgov cache engine.
//!
//! This crate provides the foundational types used across the other meshgov
//! crates:
//!
//! - [`RegistryError`] - Error type shared by caches, the manager and stores
//! - [`CacheIndex`] / [`CacheRegistry`] - The closed set of resource kinds and
//!   the explicit name-to-index registry
//! - [`Record`] - Contract every entity pulled from the store satisfies
//! - [`Store`] - The durable store collaborator (incremental `get_more_*` pulls)
//! - [`Revision`] - Deterministic fingerprints used to suppress unchanged payloads
//!
//! ## Example
//!
//! ```rust
//! use meshgov_core::{CacheIndex, CacheRegistry, Revision};
//!
//! let registry = CacheRegistry::with_builtin_caches();
//! assert_eq!(registry.get("namespace"), Some(CacheIndex::Namespace));
//!
//! // Composite revisions do not depend on input order.
//! assert_eq!(Revision::compose(["a", "b"]), Revision::compose(["b", "a"]));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod index;
mod model;
mod revision;
mod store;

pub use error::RegistryError;
pub use index::{CacheIndex, CacheRegistry, SharedCacheRegistry};
pub use model::{Instance, Namespace, Record, Rule, RuleKind, Service, EXPORT_ALL};
pub use revision::Revision;
pub use store::{Store, StoreError, StoreResult};

/// Result type alias using [`RegistryError`].
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Alias for Result used throughout the workspace.
pub type RegistryResult<T> = Result<T>;
