//! The durable store collaborator.
//!
//! Caches never query the store for a full listing after the first pull.
//! Each `get_more_*` call returns every record whose modify timestamp is at
//! or after `since`, including soft-deleted records once `first_load` is
//! false.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Instance, Namespace, Rule, RuleKind, Service};

/// Errors reported by a [`Store`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that could not be decoded.
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Incremental read surface of the durable store.
///
/// Implementations must return complete, deterministic results for a given
/// `since`: every record with `modify_time >= since`. When `first_load` is
/// true, soft-deleted records may be omitted since the caller holds no
/// prior state to reconcile.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Namespaces modified at or after `since`.
    async fn get_more_namespaces(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Namespace>>;

    /// Services modified at or after `since`.
    async fn get_more_services(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Service>>;

    /// Instances modified at or after `since`.
    async fn get_more_instances(
        &self,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Instance>>;

    /// Rules of `kind` modified at or after `since`.
    async fn get_more_rules(
        &self,
        kind: RuleKind,
        since: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<Rule>>;
}
