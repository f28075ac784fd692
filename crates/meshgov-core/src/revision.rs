//! Revisions: content fingerprints for change suppression.
//!
//! Read paths hand clients a [`Revision`]; a client that presents the
//! current revision back gets "unchanged" instead of the full payload.
//! Composite revisions are order-independent so that two processes
//! composing the same logical set always agree.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;

/// Fingerprint of a resource or resource set.
///
/// An empty revision represents "no revision known" and never matches.
///
/// # Example
///
/// ```rust
/// use meshgov_core::Revision;
///
/// let a = Revision::compose(["r1", "r2", "r3"]);
/// let b = Revision::compose(["r3", "r1", "r2"]);
/// assert_eq!(a, b);
/// assert!(a.matches(b.as_str()));
/// assert!(!Revision::empty().matches(""));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(String);

impl Revision {
    /// Create a revision from a string.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    /// Create an empty revision.
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Compose a revision from constituent parts.
    ///
    /// Parts are sorted before hashing, so the result does not depend on
    /// iteration order. The digest is 64-bit FNV-1a over the NUL-separated
    /// parts, rendered as 16 hex characters.
    #[must_use]
    pub fn compose<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts: Vec<S> = parts.into_iter().collect();
        parts.sort_unstable_by(|a, b| a.as_ref().cmp(b.as_ref()));

        let mut hasher = FnvHasher::default();
        for part in &parts {
            hasher.write(part.as_ref().as_bytes());
            hasher.write_u8(0);
        }
        Self(format!("{:016x}", hasher.finish()))
    }

    /// Compose a revision over `(key, revision)` pairs.
    ///
    /// Keys take part in the digest, so the same revisions attached to
    /// different keys produce a different result.
    #[must_use]
    pub fn of_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::compose(
            records
                .into_iter()
                .map(|(key, revision)| format!("{key}:{revision}")),
        )
    }

    /// Check whether a client-supplied revision equals this one.
    #[must_use]
    pub fn matches(&self, client_revision: &str) -> bool {
        !self.0.is_empty() && self.0 == client_revision
    }

    /// Check if the revision is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the revision as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
