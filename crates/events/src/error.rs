//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resource key could not be parsed or validated.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// An owner reference needs the owner's uid.
    #[error("{kind} '{name}' has no uid, cannot be referenced as an owner")]
    MissingUid { kind: String, name: String },
}

impl Error {
    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing uid error.
    pub fn missing_uid(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingUid {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_key("Team_A", "must be lowercase");
        assert!(err.to_string().contains("Team_A"));
        assert!(err.to_string().contains("must be lowercase"));
    }

    #[test]
    fn test_missing_uid_display() {
        let err = Error::missing_uid("Namespace", "team-a");
        assert!(err.to_string().contains("Namespace"));
        assert!(err.to_string().contains("team-a"));
    }
}
