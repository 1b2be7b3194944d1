//! Key canonicalization and namespace prefixing.
//!
//! A [`Namespace`] partitions a shared backend between providers: every user
//! key is stored under a deterministic `root:group:key` prefix. The
//! [`Key`] pair keeps both forms around -- the resolved form is what users
//! see in events and errors, the namespaced form is what adapters store.

use std::fmt;

/// Separator between namespace segments and the user key.
const SEPARATOR: char = ':';

/// A provider-scoped key prefix.
///
/// Built from a root segment plus optional group segments, joined with `:`.
/// Segments must be non-empty and must not contain the separator; the
/// round-trip guarantee of [`Namespace::resolve`] depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    path: String,
}

impl Namespace {
    /// Creates a namespace from a root segment.
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        let path = root.into();
        debug_assert!(!path.is_empty(), "namespace root must be non-empty");
        debug_assert!(
            !path.contains(SEPARATOR),
            "namespace root must not contain the separator"
        );
        Self { path }
    }

    /// Returns a child namespace with `segment` appended.
    #[must_use]
    pub fn group(&self, segment: &str) -> Self {
        debug_assert!(!segment.is_empty(), "namespace segment must be non-empty");
        debug_assert!(
            !segment.contains(SEPARATOR),
            "namespace segment must not contain the separator"
        );
        Self {
            path: format!("{}{SEPARATOR}{segment}", self.path),
        }
    }

    /// Mints the resolved/namespaced pair for a user key.
    #[must_use]
    pub fn key(&self, key: &str) -> Key {
        Key {
            resolved: key.to_string(),
            namespaced: format!("{}{SEPARATOR}{key}", self.path),
        }
    }

    /// The storage prefix shared by every key of this namespace.
    ///
    /// Ends with the separator, so prefix matching cannot cross into a
    /// sibling namespace that happens to share a leading substring.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}{SEPARATOR}", self.path)
    }

    /// Recovers the resolved key from a stored (namespaced) key.
    ///
    /// Returns `None` when the stored key does not belong to this namespace.
    #[must_use]
    pub fn resolve(&self, namespaced: &str) -> Option<String> {
        namespaced
            .strip_prefix(&self.prefix())
            .map(ToString::to_string)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// The resolved/namespaced pair for one user key.
///
/// Two handles with equal resolved keys within the same provider address the
/// same storage row, because namespacing is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    resolved: String,
    namespaced: String,
}

impl Key {
    /// The user-visible form, used in events and errors.
    #[must_use]
    pub fn resolved(&self) -> &str {
        &self.resolved
    }

    /// The stored form handed to adapters.
    #[must_use]
    pub fn namespaced(&self) -> &str {
        &self.namespaced
    }
}
