//! Event-to-work-item mapping.
//!
//! Pure functions only: no cluster calls, no logging. Existence of the
//! target resource is checked at reconcile time, never here.

use itertools::Itertools;

use crate::event::ControllerEvent;
use crate::resource::{OwnerReference, Resource, api_group};
use crate::types::ObjectKey;

/// Map an event from any source to the keys that need reconciling.
///
/// - primary watch events map to the object's own key
/// - owned watch events map to the key of their controller owner of type
///   `P`, or to nothing when the object is orphaned
/// - external events map to the key they carry
pub fn map_event<P, C>(event: &ControllerEvent<P, C>) -> Vec<ObjectKey>
where
    P: Resource,
    C: Resource,
{
    match event {
        ControllerEvent::Primary(watch) => vec![watch.object().key()],
        ControllerEvent::Owned(watch) => owner_keys::<P, C>(watch.object()),
        ControllerEvent::External(generic) => vec![generic.key.clone()],
    }
}

/// Keys of the `P` controllers owning `child`.
pub fn owner_keys<P, C>(child: &C) -> Vec<ObjectKey>
where
    P: Resource,
    C: Resource,
{
    let meta = child.meta();
    meta.owner_references
        .iter()
        .filter(|owner| is_controller_of::<P>(owner))
        .map(|owner| ObjectKey {
            namespace: meta.namespace.clone().filter(|_| P::NAMESPACED),
            name: owner.name.clone(),
        })
        .unique()
        .collect_vec()
}

/// Owner references are matched by group and kind; the version may differ.
fn is_controller_of<P: Resource>(owner: &OwnerReference) -> bool {
    owner.controller
        && !owner.name.is_empty()
        && owner.kind == P::KIND
        && api_group(&owner.api_version) == api_group(P::API_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{GenericEvent, WatchEvent};
    use crate::resource::{Namespace, ObjectMeta, Role};

    type Event = ControllerEvent<Namespace, Role>;

    fn namespace_owner(name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "Namespace".to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: true,
            block_owner_deletion: true,
        }
    }

    fn owned_role(owner: Option<OwnerReference>) -> Role {
        let metadata = ObjectMeta::named("reader").in_namespace("team-a");
        let metadata = match owner {
            Some(owner) => metadata.with_owner(owner),
            None => metadata,
        };
        Role {
            metadata,
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_primary_events_map_to_own_key() {
        for watch in [
            WatchEvent::Added(Namespace::new("team-a")),
            WatchEvent::Modified(Namespace::new("team-a")),
            WatchEvent::Deleted(Namespace::new("team-a")),
        ] {
            let keys = map_event(&Event::Primary(watch));
            assert_eq!(keys, vec![ObjectKey::cluster_scoped("team-a")]);
        }
    }

    #[test]
    fn test_owned_event_maps_to_owner() {
        let role = owned_role(Some(namespace_owner("team-a")));
        let keys = map_event(&Event::Owned(WatchEvent::Modified(role)));
        assert_eq!(keys, vec![ObjectKey::cluster_scoped("team-a")]);
    }

    #[test]
    fn test_orphaned_owned_event_is_dropped() {
        let role = owned_role(None);
        assert!(map_event(&Event::Owned(WatchEvent::Added(role))).is_empty());
    }

    #[test]
    fn test_non_controller_owner_is_ignored() {
        let mut owner = namespace_owner("team-a");
        owner.controller = false;
        let role = owned_role(Some(owner));
        assert!(map_event(&Event::Owned(WatchEvent::Deleted(role))).is_empty());
    }

    #[test]
    fn test_owner_of_other_kind_is_ignored() {
        let mut owner = namespace_owner("team-a");
        owner.kind = "Deployment".to_string();
        owner.api_version = "apps/v1".to_string();
        let role = owned_role(Some(owner));
        assert!(map_event(&Event::Owned(WatchEvent::Added(role))).is_empty());
    }

    #[test]
    fn test_owner_version_does_not_matter() {
        let mut owner = namespace_owner("team-a");
        owner.api_version = "v2".to_string();
        let role = owned_role(Some(owner));
        assert_eq!(
            map_event(&Event::Owned(WatchEvent::Added(role))),
            vec![ObjectKey::cluster_scoped("team-a")]
        );
    }

    #[test]
    fn test_namespaced_owner_inherits_child_namespace() {
        let owner = OwnerReference {
            api_version: "rbac.authorization.k8s.io/v1".to_string(),
            kind: "Role".to_string(),
            name: "parent".to_string(),
            uid: "uid-parent".to_string(),
            controller: true,
            block_owner_deletion: false,
        };
        let child = owned_role(Some(owner));
        assert_eq!(
            owner_keys::<Role, Role>(&child),
            vec![ObjectKey::namespaced("team-a", "parent")]
        );
    }

    #[test]
    fn test_external_event_maps_without_existence_check() {
        let event = Event::External(GenericEvent::new(ObjectKey::cluster_scoped("missing")));
        assert_eq!(map_event(&event), vec![ObjectKey::cluster_scoped("missing")]);
    }
}
