//! Error types for the reconciler crate.

use ebb_events::ObjectKey;
use thiserror::Error;

use crate::cluster::ClusterError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A cluster API call failed.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// A resource could not be turned into the desired state.
    #[error("resource error: {0}")]
    Resource(#[from] ebb_events::Error),

    /// Reconciliation failed.
    #[error("reconcile of '{key}' failed: {reason}")]
    ReconcileFailed { key: ObjectKey, reason: String },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ebb_core::Error),

    /// A controller was built without any event source.
    #[error("controller '{name}' has no event sources")]
    NoEventSources { name: String },

    /// A background task of the controller failed.
    #[error("controller task failed: {reason}")]
    TaskFailed { reason: String },
}

impl Error {
    /// Create a reconcile failed error.
    pub fn reconcile_failed(key: &ObjectKey, reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config(ebb_core::Error::invalid_config(field, reason))
    }

    /// Create a task failed error.
    pub fn task_failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error signals a write that lost a race with another
    /// writer. Such reconciles are retried immediately.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Cluster(ClusterError::AlreadyExists { .. } | ClusterError::Conflict { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::reconcile_failed(&ObjectKey::cluster_scoped("team-a"), "boom");
        assert!(err.to_string().contains("team-a"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(Error::from(ClusterError::conflict("Role", "team-a/reader")).is_conflict());
        assert!(Error::from(ClusterError::already_exists("Role", "team-a/reader")).is_conflict());
        assert!(!Error::from(ClusterError::unavailable("connection refused")).is_conflict());
        assert!(!Error::invalid_config("controller.workers", "must be positive").is_conflict());
    }
}
