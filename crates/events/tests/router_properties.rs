//! Property-based tests for the event router using proptest.
//!
//! Properties verified:
//! - Primary and external events always map to exactly their own key
//! - Owned events map to exactly the set of distinct controller owners
//! - Owned events without a controller owner never produce work

use ebb_events::{
    ControllerEvent, GenericEvent, Namespace, ObjectKey, ObjectMeta, OwnerReference, Role,
    WatchEvent, map_event,
};
use proptest::prelude::*;

type Event = ControllerEvent<Namespace, Role>;

fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,10}[a-z0-9]"
}

fn owner(name: String, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Namespace".to_string(),
        uid: format!("uid-{name}"),
        name,
        controller,
        block_owner_deletion: false,
    }
}

proptest! {
    #[test]
    fn prop_primary_maps_to_own_key(name in label()) {
        let event = Event::Primary(WatchEvent::Modified(Namespace::new(name.clone())));
        prop_assert_eq!(map_event(&event), vec![ObjectKey::cluster_scoped(name)]);
    }

    #[test]
    fn prop_external_maps_to_carried_key(name in label()) {
        let key = ObjectKey::cluster_scoped(name);
        let event = Event::External(GenericEvent::new(key.clone()));
        prop_assert_eq!(map_event(&event), vec![key]);
    }

    #[test]
    fn prop_owned_maps_to_distinct_controllers(
        owners in proptest::collection::vec((label(), any::<bool>()), 0..6),
    ) {
        let metadata = owners
            .iter()
            .cloned()
            .fold(ObjectMeta::named("reader").in_namespace("team-a"), |meta, (name, controller)| {
                meta.with_owner(owner(name, controller))
            });
        let role = Role { metadata, rules: Vec::new() };

        let keys = map_event(&Event::Owned(WatchEvent::Added(role)));

        let mut expected: Vec<ObjectKey> = owners
            .iter()
            .filter(|(_, controller)| *controller)
            .map(|(name, _)| ObjectKey::cluster_scoped(name.clone()))
            .collect();
        expected.sort();
        expected.dedup();

        let mut actual = keys.clone();
        actual.sort();
        prop_assert_eq!(actual, expected);

        // no duplicates in the raw output either
        let mut deduped = keys.clone();
        deduped.sort();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), keys.len());
    }
}
