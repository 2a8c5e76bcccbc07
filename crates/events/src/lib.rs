//! Resource model and event routing for the reconciliation bridge.
//!
//! Three kinds of events feed the control loop:
//!
//! - **Primary watch events**: the namespaces themselves changed
//! - **Owned watch events**: a Role owned by a namespace changed
//! - **External events**: a queue message asked for a namespace to be
//!   reconciled
//!
//! [`ControllerEvent`] tags them and [`map_event`] turns any of them into
//! [`ObjectKey`] work items.
//!
//! # Example
//!
//! ```
//! use ebb_events::{ControllerEvent, GenericEvent, Namespace, ObjectKey, Role, map_event};
//!
//! let event: ControllerEvent<Namespace, Role> =
//!     ControllerEvent::External(GenericEvent::new(ObjectKey::cluster_scoped("team-a")));
//!
//! assert_eq!(map_event(&event), vec![ObjectKey::cluster_scoped("team-a")]);
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod event;
pub mod resource;
pub mod router;
pub mod types;

// Re-export main types
pub use error::{Error, Result};
pub use event::{ControllerEvent, GenericEvent, WatchEvent};
pub use resource::{
    Namespace, NamespacePhase, ObjectMeta, OwnerReference, PolicyRule, Resource, Role, api_group,
};
pub use router::{map_event, owner_keys};
pub use types::{EventId, MAX_LABEL_LEN, ObjectKey, validate_dns_label};
