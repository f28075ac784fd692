//! Entity records pulled from the store.
//!
//! Every record carries a modify timestamp and a validity flag: `valid ==
//! false` is a soft delete. The [`Record`] trait exposes exactly what the
//! incremental merge needs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CacheIndex;

/// Export target meaning "visible from every namespace".
pub const EXPORT_ALL: &str = "*";

/// Contract for entities held by a resource cache.
///
/// The setters exist for the store side (which stamps timestamps and soft
/// deletes); caches only read.
pub trait Record: Clone + fmt::Debug + Send + Sync + 'static {
    /// Key in the authoritative map.
    fn key(&self) -> &str;

    /// `false` when the record is soft-deleted.
    fn is_valid(&self) -> bool;

    /// Modify timestamp assigned by the store.
    fn modify_time(&self) -> DateTime<Utc>;

    /// Content revision of this record.
    fn revision(&self) -> &str;

    /// Set the modify timestamp.
    fn set_modify_time(&mut self, mtime: DateTime<Utc>);

    /// Set the validity flag.
    fn set_valid(&mut self, valid: bool);

    /// Validate a pulled record before it is merged.
    ///
    /// # Errors
    ///
    /// Returns the reason the record is malformed.
    fn check(&self) -> Result<(), String> {
        if self.key().is_empty() {
            return Err("empty key".to_string());
        }
        Ok(())
    }
}

macro_rules! impl_record_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Mark as soft-deleted.
            #[must_use]
            pub fn deleted(mut self) -> Self {
                self.valid = false;
                self
            }

            /// Set the modify timestamp.
            #[must_use]
            pub fn at(mut self, mtime: DateTime<Utc>) -> Self {
                self.modify_time = mtime;
                self
            }

            /// Set the revision.
            #[must_use]
            pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
                self.revision = revision.into();
                self
            }
        }
    };
}

macro_rules! impl_record_core {
    ($key:ident) => {
        fn key(&self) -> &str {
            &self.$key
        }

        fn is_valid(&self) -> bool {
            self.valid
        }

        fn modify_time(&self) -> DateTime<Utc> {
            self.modify_time
        }

        fn revision(&self) -> &str {
            &self.revision
        }

        fn set_modify_time(&mut self, mtime: DateTime<Utc>) {
            self.modify_time = mtime;
        }

        fn set_valid(&mut self, valid: bool) {
            self.valid = valid;
        }
    };
}

/// A namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Unique name.
    pub name: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
    /// Owner principals.
    #[serde(default)]
    pub owners: BTreeSet<String>,
    /// Namespaces allowed to see this namespace's services; may contain
    /// [`EXPORT_ALL`].
    #[serde(default)]
    pub service_export_to: BTreeSet<String>,
    /// Content revision.
    #[serde(default)]
    pub revision: String,
    /// Soft-delete flag.
    pub valid: bool,
    /// Modify timestamp.
    pub modify_time: DateTime<Utc>,
}

impl Namespace {
    /// Create a valid namespace with an epoch timestamp.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comment: String::new(),
            owners: BTreeSet::new(),
            service_export_to: BTreeSet::new(),
            revision: String::new(),
            valid: true,
            modify_time: DateTime::UNIX_EPOCH,
        }
    }

    /// Set the namespaces this namespace exports its services to.
    #[must_use]
    pub fn with_export_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_export_to = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Add an owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owners.insert(owner.into());
        self
    }
}

impl_record_accessors!(Namespace);

impl Record for Namespace {
    impl_record_core!(name);
}

/// A service registered in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique id.
    pub id: String,
    /// Name, unique within the namespace.
    pub name: String,
    /// Owning namespace.
    pub namespace: String,
    /// Namespaces this service is individually exported to; may contain
    /// [`EXPORT_ALL`].
    #[serde(default)]
    pub export_to: BTreeSet<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Content revision.
    #[serde(default)]
    pub revision: String,
    /// Soft-delete flag.
    pub valid: bool,
    /// Modify timestamp.
    pub modify_time: DateTime<Utc>,
}

impl Service {
    /// Create a valid service.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            namespace: namespace.into(),
            export_to: BTreeSet::new(),
            metadata: BTreeMap::new(),
            revision: String::new(),
            valid: true,
            modify_time: DateTime::UNIX_EPOCH,
        }
    }

    /// Set the namespaces this service is exported to.
    #[must_use]
    pub fn with_export_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.export_to = targets.into_iter().map(Into::into).collect();
        self
    }
}

impl_record_accessors!(Service);

impl Record for Service {
    impl_record_core!(id);

    fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty key".to_string());
        }
        if self.valid && (self.name.is_empty() || self.namespace.is_empty()) {
            return Err("service without name or namespace".to_string());
        }
        Ok(())
    }
}

/// A service instance (endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique id.
    pub id: String,
    /// Id of the owning service.
    pub service_id: String,
    /// Host address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Load-balancing weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Last reported health.
    #[serde(default = "default_true")]
    pub healthy: bool,
    /// Taken out of rotation by an operator.
    #[serde(default)]
    pub isolate: bool,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Content revision.
    #[serde(default)]
    pub revision: String,
    /// Soft-delete flag.
    pub valid: bool,
    /// Modify timestamp.
    pub modify_time: DateTime<Utc>,
}

fn default_weight() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Instance {
    /// Create a valid, healthy instance.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            healthy: true,
            isolate: false,
            metadata: BTreeMap::new(),
            revision: String::new(),
            valid: true,
            modify_time: DateTime::UNIX_EPOCH,
        }
    }

    /// Mark the instance as isolated.
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.isolate = true;
        self
    }
}

impl_record_accessors!(Instance);

impl Record for Instance {
    impl_record_core!(id);

    fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty key".to_string());
        }
        if self.valid && self.service_id.is_empty() {
            return Err("instance without service".to_string());
        }
        Ok(())
    }
}

/// Family of governance rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Routing rules.
    Routing,
    /// Rate-limit rules.
    RateLimit,
    /// Circuit-breaker rules.
    CircuitBreaker,
    /// Fault-detect rules.
    FaultDetect,
    /// Lane rules.
    Lane,
}

impl RuleKind {
    /// Every rule kind.
    pub const ALL: [RuleKind; 5] = [
        RuleKind::Routing,
        RuleKind::RateLimit,
        RuleKind::CircuitBreaker,
        RuleKind::FaultDetect,
        RuleKind::Lane,
    ];

    /// Cache holding rules of this kind.
    #[must_use]
    pub fn cache_index(self) -> CacheIndex {
        match self {
            RuleKind::Routing => CacheIndex::RoutingRule,
            RuleKind::RateLimit => CacheIndex::RateLimitRule,
            RuleKind::CircuitBreaker => CacheIndex::CircuitBreakerRule,
            RuleKind::FaultDetect => CacheIndex::FaultDetectRule,
            RuleKind::Lane => CacheIndex::LaneRule,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_index().name())
    }
}

/// A traffic-governance rule bound to a service (or to every service of a
/// namespace when `service` is [`EXPORT_ALL`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id.
    pub id: String,
    /// Rule family.
    pub kind: RuleKind,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Namespace of the target service.
    pub namespace: String,
    /// Target service name.
    pub service: String,
    /// Whether the rule is switched on.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Rule body, opaque to the cache.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Content revision.
    #[serde(default)]
    pub revision: String,
    /// Soft-delete flag.
    pub valid: bool,
    /// Modify timestamp.
    pub modify_time: DateTime<Utc>,
}

impl Rule {
    /// Create a valid, enabled rule with an empty body.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: RuleKind,
        namespace: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            name: String::new(),
            namespace: namespace.into(),
            service: service.into(),
            enable: true,
            body: serde_json::Value::Null,
            revision: String::new(),
            valid: true,
            modify_time: DateTime::UNIX_EPOCH,
        }
    }

    /// Set the rule body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Switch the rule off.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enable = false;
        self
    }
}

impl_record_accessors!(Rule);

impl Record for Rule {
    impl_record_core!(id);

    fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty key".to_string());
        }
        if self.valid && self.namespace.is_empty() {
            return Err("rule without namespace".to_string());
        }
        Ok(())
    }
}
