//! Watch and synthetic event types.

use serde::{Deserialize, Serialize};

use crate::types::{EventId, ObjectKey};

/// Change notification from a resource watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
}

impl<R> WatchEvent<R> {
    /// The object carried by the event.
    pub const fn object(&self) -> &R {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    /// Get the event type as a string.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Synthetic event injected from outside the cluster.
///
/// Carries only the identity of the resource to reconcile, never the queue
/// message that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericEvent {
    pub event_id: EventId,
    pub key: ObjectKey,
    /// Id of the external message this event was decoded from, for logs.
    pub message_id: Option<String>,
}

impl GenericEvent {
    /// Create an event for `key`.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            event_id: EventId::new(),
            key,
            message_id: None,
        }
    }

    /// Create an event for `key` decoded from an external message.
    pub fn from_message(key: ObjectKey, message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::new(key)
        }
    }
}

/// Every input of the control loop, tagged by source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent<P, C> {
    /// Watch event of the primary resource type.
    Primary(WatchEvent<P>),
    /// Watch event of an owned resource type.
    Owned(WatchEvent<C>),
    /// Synthetic event from the external signal channel.
    External(GenericEvent),
}

impl<P, C> ControllerEvent<P, C> {
    /// Name of the source, for logs.
    pub const fn source(&self) -> &'static str {
        match self {
            Self::Primary(_) => "primary",
            Self::Owned(_) => "owned",
            Self::External(_) => "external",
        }
    }
}
