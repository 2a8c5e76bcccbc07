//! Core types for the events crate.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum length of a DNS-1123 label (namespace names, Role names).
pub const MAX_LABEL_LEN: usize = 63;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a resource that needs reconciling.
///
/// This is the work item key: it says *what* to reconcile, never *why*.
/// Cluster-scoped resources (namespaces) have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace of the resource, `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    /// Name of the resource.
    pub name: String,
}

impl ObjectKey {
    /// Key of a cluster-scoped resource.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Check that `value` is a DNS-1123 label: lowercase alphanumerics and `-`,
/// starting and ending with an alphanumeric, at most 63 characters.
///
/// # Errors
///
/// Returns `Error::InvalidKey` describing the first violated rule.
pub fn validate_dns_label(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_key(value, "must not be empty"));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(Error::invalid_key(
            value,
            format!("must be at most {MAX_LABEL_LEN} characters"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::invalid_key(
            value,
            "must consist of lowercase alphanumerics or '-'",
        ));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(Error::invalid_key(
            value,
            "must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}
