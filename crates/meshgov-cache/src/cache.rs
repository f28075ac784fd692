//! The resource cache contract and shared read-path types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshgov_core::{CacheIndex, RegistryError, RegistryResult, Revision};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::refresh::RefreshOutcome;
use crate::stats::StatsSnapshot;
use crate::watermark::Watermark;

/// Per-cache options, a JSON object.
pub type CacheOptions = serde_json::Map<String, serde_json::Value>;

/// Largest page a query may request.
pub const MAX_QUERY_LIMIT: usize = 100;

/// Lifecycle contract every resource cache implements.
///
/// `update` never talks to the store directly: it goes through the shared
/// refresh coordinator keyed by [`ResourceCache::name`], so the periodic
/// refresher and synchronous callers never run overlapping pulls.
#[async_trait]
pub trait ResourceCache: Send + Sync + fmt::Debug {
    /// Resource kind.
    fn index(&self) -> CacheIndex;

    /// Stable cache name.
    fn name(&self) -> &'static str {
        self.index().name()
    }

    /// Apply per-cache options before the first load.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] if the options do not
    /// describe this cache's option type.
    fn initialize(&self, options: &CacheOptions) -> RegistryResult<()>;

    /// Run one coordinated incremental pull-and-merge, reporting how this
    /// caller was satisfied whether or not the pull succeeded.
    async fn run_refresh(&self) -> (RegistryResult<()>, RefreshOutcome);

    /// Run one coordinated incremental pull-and-merge.
    async fn refresh(&self) -> RegistryResult<RefreshOutcome> {
        let (result, outcome) = self.run_refresh().await;
        result.map(|()| outcome)
    }

    /// Periodic update; a shared result counts as success.
    async fn update(&self) -> RegistryResult<()> {
        self.run_refresh().await.0
    }

    /// Read-after-write update.
    ///
    /// If the first refresh was shared, a second one runs regardless of the
    /// shared result, which either leads a fresh pull or joins one that
    /// started after the first call returned. A pull this caller led that
    /// was discarded by a concurrent clear is also run again.
    async fn force_update(&self) -> RegistryResult<()> {
        let (result, outcome) = self.run_refresh().await;
        let discarded = result.as_ref().is_err_and(RegistryError::is_discarded);
        if !outcome.is_shared() && !discarded {
            return result;
        }
        trace!(cache = self.name(), ?outcome, discarded, "refreshing again");
        self.run_refresh().await.0
    }

    /// Discard every entry and index; the next update is a first load.
    fn clear(&self) -> RegistryResult<()>;

    /// Stop refreshing and end every subscription.
    fn close(&self) -> RegistryResult<()>;

    /// Current watermark.
    fn watermark(&self) -> Watermark;

    /// Whether the next pull is a first load.
    fn is_first_update(&self) -> bool;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the cache holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot.
    fn stats(&self) -> StatsSnapshot;
}

/// Dynamically dispatched cache handle.
pub type SharedResourceCache = Arc<dyn ResourceCache>;

/// Request to open one cache, with its options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Registered cache name.
    pub name: String,
    /// Options handed to [`ResourceCache::initialize`].
    #[serde(default)]
    pub options: CacheOptions,
}

impl CacheEntry {
    /// Create an entry without options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: CacheOptions::new(),
        }
    }

    /// Add one option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Deserialize a cache's typed options.
pub(crate) fn parse_options<T: DeserializeOwned>(
    cache: &str,
    options: &CacheOptions,
) -> RegistryResult<T> {
    serde_json::from_value(serde_json::Value::Object(options.clone())).map_err(|e| {
        RegistryError::Configuration(format!("invalid options for cache {cache}: {e}"))
    })
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Matches before paging.
    pub total: usize,
    /// The requested page.
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// Apply `offset`/`limit` to sorted matches.
    pub(crate) fn slice(matches: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = matches.len();
        let items = matches.into_iter().skip(offset).take(limit).collect();
        Self { total, items }
    }
}

/// Check a query limit against [`MAX_QUERY_LIMIT`].
pub(crate) fn check_limit(limit: usize) -> RegistryResult<()> {
    if limit == 0 || limit > MAX_QUERY_LIMIT {
        return Err(RegistryError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_QUERY_LIMIT}, got {limit}"
        )));
    }
    Ok(())
}

/// Name filter: exact match, or prefix match with a trailing `*`.
pub(crate) fn matches_pattern(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Result of a revision-suppressed read.
#[derive(Debug, Clone, PartialEq)]
pub enum Versioned<T> {
    /// The client already holds the current revision.
    Unchanged {
        /// Current revision.
        revision: Revision,
    },
    /// Data changed since the client's revision.
    Changed {
        /// Current revision.
        revision: Revision,
        /// Full payload.
        items: Vec<T>,
    },
}

impl<T> Versioned<T> {
    /// Build the result for `client_revision`.
    pub fn resolve(revision: Revision, client_revision: &str, items: impl FnOnce() -> Vec<T>) -> Self {
        if revision.matches(client_revision) {
            Versioned::Unchanged { revision }
        } else {
            Versioned::Changed {
                revision,
                items: items(),
            }
        }
    }

    /// Current revision.
    pub fn revision(&self) -> &Revision {
        match self {
            Versioned::Unchanged { revision } | Versioned::Changed { revision, .. } => revision,
        }
    }

    /// Whether the client's revision was current.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Versioned::Unchanged { .. })
    }

    /// Payload, if changed.
    pub fn items(&self) -> Option<&[T]> {
        match self {
            Versioned::Unchanged { .. } => None,
            Versioned::Changed { items, .. } => Some(items),
        }
    }
}
