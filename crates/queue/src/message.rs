//! Queue message types and payload decoding.

use ebb_events::{GenericEvent, ObjectKey, validate_dns_label};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A message as delivered by the queue service; the body is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: String,
    /// Handle needed to delete this particular delivery.
    pub receipt_handle: String,
    pub body: String,
}

impl RawMessage {
    /// Create a raw message.
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
        }
    }

    /// Decode the body into the namespace it refers to.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` when the body is not JSON, has no `namespace`
    /// field, or the namespace is not a valid name.
    pub fn decode(&self) -> Result<QueueMessage> {
        let message: QueueMessage = serde_json::from_str(&self.body)
            .map_err(|e| Error::decode(&self.message_id, e.to_string()))?;

        validate_dns_label(&message.namespace)
            .map_err(|e| Error::decode(&self.message_id, e.to_string()))?;

        Ok(message)
    }

    /// Decode the body straight into a synthetic event.
    ///
    /// # Errors
    ///
    /// See [`RawMessage::decode`].
    pub fn to_event(&self) -> Result<GenericEvent> {
        self.decode()
            .map(|message| GenericEvent::from_message(message.key(), &self.message_id))
    }
}

/// Decoded message payload: `{"namespace": "team-a"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub namespace: String,
}

impl QueueMessage {
    /// Work item key of the namespace this message refers to.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::cluster_scoped(&self.namespace)
    }
}
