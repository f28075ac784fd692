//! Error types for cache synchronization.
//!
//! This module provides [`RegistryError`], the error type shared by resource
//! caches, the cache manager and the store boundary.

use std::fmt;
use std::sync::Arc;

/// Shared, cloneable error source.
type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Error type for cache synchronization.
///
/// Errors are `Clone` because a single store pull is shared by every caller
/// that joined it through the refresh coordinator; each of them receives the
/// same failure.
///
/// # Example
///
/// ```rust
/// use meshgov_core::RegistryError;
///
/// fn validate_skew(secs: i64) -> Result<(), RegistryError> {
///     if secs >= 0 {
///         return Err(RegistryError::Configuration(format!(
///             "mtime skew must be negative, got {secs}s"
///         )));
///     }
///     Ok(())
/// }
///
/// assert!(validate_skew(5).is_err());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Misconfiguration detected at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request argument rejected by a read path.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store pull for a cache failed.
    #[error("store error while loading {cache}: {message}")]
    Store {
        /// Name of the cache that issued the pull.
        cache: String,
        /// Error message.
        message: String,
        /// Underlying store error.
        #[source]
        source: Option<SharedSource>,
    },

    /// A pulled record failed validation; the whole batch was rejected.
    #[error("invalid record {key:?} in {cache}: {reason}")]
    InvalidRecord {
        /// Name of the cache that pulled the record.
        cache: String,
        /// Key of the offending record.
        key: String,
        /// Reason for the rejection.
        reason: String,
    },

    /// The pull this caller joined was dropped before producing a result.
    #[error("refresh of {cache} was abandoned before completing")]
    RefreshAbandoned {
        /// Name of the cache.
        cache: String,
    },

    /// The cache was cleared while the pull ran; its batch was dropped.
    #[error("refresh of {cache} was discarded by a concurrent clear")]
    RefreshDiscarded {
        /// Name of the cache.
        cache: String,
    },

    /// Operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// The cache was never opened for this process.
    #[error("cache {cache} is not opened")]
    NotOpened {
        /// Name of the cache.
        cache: String,
    },

    /// The cache has been closed.
    #[error("cache {cache} is closed")]
    Closed {
        /// Name of the cache.
        cache: String,
    },

    /// Several independent operations failed during a fan-out.
    #[error("{} operations failed: {}", .0.len(), DisplayAll(.0))]
    Multiple(Vec<RegistryError>),

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<SharedSource>,
    },
}

impl RegistryError {
    /// Wrap a store error with the name of the cache that issued the pull.
    pub fn store<E>(cache: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store {
            cache: cache.into(),
            message: source.to_string(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create an internal error from any error type.
    pub fn internal<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Collapse the errors of a fan-out into one result.
    ///
    /// No errors yields `Ok(())`, a single error is returned as-is and
    /// several are wrapped in [`RegistryError::Multiple`].
    pub fn aggregate(mut errors: Vec<RegistryError>) -> Result<(), RegistryError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Whether this error came from the store rather than from the cache itself.
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store { .. })
    }

    /// Whether a concurrent clear dropped the pulled batch.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::RefreshDiscarded { .. })
    }
}

struct DisplayAll<'a>(&'a [RegistryError]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
