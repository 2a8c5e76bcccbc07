//! Error types for the queue crate.

use thiserror::Error;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while consuming the queue.
#[derive(Error, Debug)]
pub enum Error {
    /// The receive call failed (network, throttling, service error).
    #[error("receive failed: {reason}")]
    ReceiveFailed { reason: String },

    /// Deleting a consumed message failed.
    #[error("delete of '{receipt_handle}' failed: {reason}")]
    DeleteFailed {
        receipt_handle: String,
        reason: String,
    },

    /// A message body could not be decoded.
    #[error("message '{message_id}' could not be decoded: {reason}")]
    Decode { message_id: String, reason: String },

    /// The queue service answered with an error status.
    #[error("queue service returned {status}: {body}")]
    ServiceError { status: u16, body: String },

    /// The internal event channel was closed by the receiving side.
    #[error("event channel closed")]
    ChannelClosed,

    /// HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] ebb_core::Error),
}

impl Error {
    /// Create a receive failed error.
    pub fn receive_failed(reason: impl Into<String>) -> Self {
        Self::ReceiveFailed {
            reason: reason.into(),
        }
    }

    /// Create a delete failed error.
    pub fn delete_failed(receipt_handle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeleteFailed {
            receipt_handle: receipt_handle.into(),
            reason: reason.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the poll loop can carry on after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::ChannelClosed | Self::Core(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = Error::decode("msg-5", "missing field `namespace`");
        assert!(err.to_string().contains("msg-5"));
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::receive_failed("timeout").is_transient());
        assert!(Error::delete_failed("rh-1", "gone").is_transient());
        assert!(!Error::ChannelClosed.is_transient());
        assert!(!Error::Core(ebb_core::Error::missing_config("queue.url")).is_transient());
    }
}
