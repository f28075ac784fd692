//! Resource kinds and the cache-name registry.
//!
//! [`CacheIndex`] is the closed set of resource kinds the cache manager
//! owns, usable as a dense array index. [`CacheRegistry`] maps stable cache
//! names to indexes; it is built once at startup and shared by reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::{RegistryError, RegistryResult};

/// Closed enumeration of the resource kinds held in memory.
///
/// The discriminant doubles as the position of the cache in the manager's
/// dense cache collection, so the collection length always equals
/// [`CacheIndex::COUNT`].
///
/// # Example
///
/// ```rust
/// use meshgov_core::CacheIndex;
///
/// assert_eq!(CacheIndex::Namespace.as_usize(), 0);
/// assert_eq!(CacheIndex::from_name("instance"), Some(CacheIndex::Instance));
/// assert_eq!(CacheIndex::ALL.len(), CacheIndex::COUNT);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheIndex {
    /// Namespaces and their service visibility.
    Namespace = 0,
    /// Services.
    Service,
    /// Service instances.
    Instance,
    /// Routing rules.
    RoutingRule,
    /// Rate-limit rules.
    RateLimitRule,
    /// Circuit-breaker rules.
    CircuitBreakerRule,
    /// Fault-detect rules.
    FaultDetectRule,
    /// Lane (traffic lane) rules.
    LaneRule,
}

impl CacheIndex {
    /// Cache name for namespaces.
    pub const NAMESPACE: &'static str = "namespace";
    /// Cache name for services.
    pub const SERVICE: &'static str = "service";
    /// Cache name for instances.
    pub const INSTANCE: &'static str = "instance";
    /// Cache name for routing rules.
    pub const ROUTING_RULE: &'static str = "routingRule";
    /// Cache name for rate-limit rules.
    pub const RATE_LIMIT_RULE: &'static str = "rateLimitRule";
    /// Cache name for circuit-breaker rules.
    pub const CIRCUIT_BREAKER_RULE: &'static str = "circuitBreakerRule";
    /// Cache name for fault-detect rules.
    pub const FAULT_DETECT_RULE: &'static str = "faultDetectRule";
    /// Cache name for lane rules.
    pub const LANE_RULE: &'static str = "laneRule";

    /// Number of resource kinds (the enumeration's terminal sentinel).
    pub const COUNT: usize = 8;

    /// Every index, in collection order.
    pub const ALL: [CacheIndex; Self::COUNT] = [
        CacheIndex::Namespace,
        CacheIndex::Service,
        CacheIndex::Instance,
        CacheIndex::RoutingRule,
        CacheIndex::RateLimitRule,
        CacheIndex::CircuitBreakerRule,
        CacheIndex::FaultDetectRule,
        CacheIndex::LaneRule,
    ];

    /// Position of this kind in the cache collection.
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self as usize
    }

    /// Stable cache name for this kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CacheIndex::Namespace => Self::NAMESPACE,
            CacheIndex::Service => Self::SERVICE,
            CacheIndex::Instance => Self::INSTANCE,
            CacheIndex::RoutingRule => Self::ROUTING_RULE,
            CacheIndex::RateLimitRule => Self::RATE_LIMIT_RULE,
            CacheIndex::CircuitBreakerRule => Self::CIRCUIT_BREAKER_RULE,
            CacheIndex::FaultDetectRule => Self::FAULT_DETECT_RULE,
            CacheIndex::LaneRule => Self::LANE_RULE,
        }
    }

    /// Look up a kind by its built-in cache name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|index| index.name() == name)
    }
}

impl fmt::Display for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry mapping cache names to [`CacheIndex`] values.
///
/// Populated during startup through [`CacheRegistry::register`] and then
/// shared read-only (see [`SharedCacheRegistry`]).
#[derive(Debug, Default, Clone)]
pub struct CacheRegistry {
    names: HashMap<String, CacheIndex>,
}

impl CacheRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in cache name registered.
    #[must_use]
    pub fn with_builtin_caches() -> Self {
        let mut registry = Self::new();
        for index in CacheIndex::ALL {
            registry.register(index.name(), index);
        }
        registry
    }

    /// Register a cache name.
    ///
    /// Names must be unique: a duplicate registration is logged and ignored,
    /// keeping the first mapping. Returns `true` if the name was added.
    pub fn register(&mut self, name: impl Into<String>, index: CacheIndex) -> bool {
        let name = name.into();
        if let Some(existing) = self.names.get(&name) {
            warn!(
                name = %name,
                existing = %existing,
                ignored = %index,
                "duplicate cache registration ignored"
            );
            return false;
        }
        self.names.insert(name, index);
        true
    }

    /// Get the index registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CacheIndex> {
        self.names.get(name).copied()
    }

    /// Check if a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Indexes that no registered name points at.
    #[must_use]
    pub fn missing(&self) -> Vec<CacheIndex> {
        CacheIndex::ALL
            .iter()
            .copied()
            .filter(|index| !self.names.values().any(|v| v == index))
            .collect()
    }

    /// Fail if any [`CacheIndex`] lacks a registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] naming the missing kinds.
    pub fn validate(&self) -> RegistryResult<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|index| index.name()).collect();
        Err(RegistryError::Configuration(format!(
            "no cache registered for {}",
            names.join(", ")
        )))
    }
}

/// Registry shared by reference between the manager and its callers.
pub type SharedCacheRegistry = Arc<CacheRegistry>;
