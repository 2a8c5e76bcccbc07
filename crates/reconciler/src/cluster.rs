//! Cluster API contract and an in-memory implementation.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use ebb_events::{Namespace, NamespacePhase, Resource, Role, WatchEvent};
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Stream of watch events for one resource type.
pub type WatchStream<R> = BoxStream<'static, WatchEvent<R>>;

/// Errors returned by the cluster API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// A create raced with another writer.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// An update was based on a stale resource version.
    #[error("conflicting write to {kind} '{name}'")]
    Conflict { kind: String, name: String },

    /// The API could not be reached or answered with a server error.
    #[error("cluster API unavailable: {reason}")]
    Unavailable { reason: String },

    /// The request was rejected as malformed.
    #[error("invalid request: {reason}")]
    Invalid { reason: String },
}

impl ClusterError {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The slice of the cluster API the bridge needs.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Fetch a namespace.
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError>;

    /// Fetch a role.
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError>;

    /// Create a role; fails with `AlreadyExists` if it is already there.
    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError>;

    /// Replace a role; fails with `Conflict` if its resource version is
    /// stale.
    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError>;

    /// Watch every namespace.
    fn watch_namespaces(&self) -> WatchStream<Namespace>;

    /// Watch the roles this bridge manages.
    fn watch_roles(&self) -> WatchStream<Role>;
}

/// Mutation counters of an [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mutations {
    pub creates: usize,
    pub updates: usize,
}

impl Mutations {
    /// Creates and updates together.
    pub const fn total(&self) -> usize {
        self.creates.saturating_add(self.updates)
    }
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    roles: BTreeMap<(String, String), Role>,
    mutations: Mutations,
    failing_writes: VecDeque<ClusterError>,
    next_uid: u64,
    next_version: u64,
}

impl State {
    fn next_uid(&mut self) -> String {
        self.next_uid = self.next_uid.saturating_add(1);
        format!("uid-{}", self.next_uid)
    }

    fn next_version(&mut self) -> String {
        self.next_version = self.next_version.saturating_add(1);
        self.next_version.to_string()
    }
}

/// Cluster held in memory: every write bumps a resource version, counts as
/// a mutation and is broadcast to watchers.
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    namespace_events: broadcast::Sender<WatchEvent<Namespace>>,
    role_events: broadcast::Sender<WatchEvent<Role>>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        let (namespace_events, _) = broadcast::channel(256);
        let (role_events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            namespace_events,
            role_events,
        }
    }

    /// Create or replace a namespace, assigning a uid on first write.
    pub async fn apply_namespace(&self, mut namespace: Namespace) -> Namespace {
        let mut state = self.state.lock().await;
        let existing = state.namespaces.get(&namespace.metadata.name).cloned();

        namespace.metadata.uid = match existing.as_ref() {
            Some(current) => current.metadata.uid.clone(),
            None => Some(state.next_uid()),
        };
        namespace.metadata.resource_version = Some(state.next_version());
        state
            .namespaces
            .insert(namespace.metadata.name.clone(), namespace.clone());
        drop(state);

        let event = if existing.is_some() {
            WatchEvent::Modified(namespace.clone())
        } else {
            WatchEvent::Added(namespace.clone())
        };
        let _ = self.namespace_events.send(event);
        namespace
    }

    /// Create an active namespace called `name`.
    pub async fn create_namespace(&self, name: &str) -> Namespace {
        self.apply_namespace(Namespace::new(name)).await
    }

    /// Flag a namespace as terminating.
    pub async fn terminate_namespace(&self, name: &str) -> Option<Namespace> {
        let mut namespace = self.namespace(name).await?;
        namespace.phase = NamespacePhase::Terminating;
        Some(self.apply_namespace(namespace).await)
    }

    /// Remove a namespace and every role in it.
    pub async fn delete_namespace(&self, name: &str) -> Option<Namespace> {
        let mut state = self.state.lock().await;
        let removed = state.namespaces.remove(name)?;
        let roles: Vec<(String, String)> = state
            .roles
            .keys()
            .filter(|(namespace, _)| namespace == name)
            .cloned()
            .collect();
        let removed_roles: Vec<Role> = roles
            .iter()
            .filter_map(|key| state.roles.remove(key))
            .collect();
        drop(state);

        for role in removed_roles {
            let _ = self.role_events.send(WatchEvent::Deleted(role));
        }
        let _ = self
            .namespace_events
            .send(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Remove a role, as a user deleting it by hand would.
    pub async fn delete_role(&self, namespace: &str, name: &str) -> Option<Role> {
        let removed = self
            .state
            .lock()
            .await
            .roles
            .remove(&(namespace.to_string(), name.to_string()))?;
        let _ = self.role_events.send(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Make the next `count` creates or updates fail with `error`.
    pub async fn fail_next_writes(&self, error: ClusterError, count: usize) {
        let mut state = self.state.lock().await;
        state
            .failing_writes
            .extend(std::iter::repeat_n(error, count));
    }

    /// Current state of a namespace.
    pub async fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state.lock().await.namespaces.get(name).cloned()
    }

    /// Current state of a role.
    pub async fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.state
            .lock()
            .await
            .roles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every role in the cluster.
    pub async fn roles(&self) -> Vec<Role> {
        self.state.lock().await.roles.values().cloned().collect()
    }

    /// Writes performed through the [`ClusterApi`].
    pub async fn mutations(&self) -> Mutations {
        self.state.lock().await.mutations
    }

    fn role_key(role: &Role) -> Result<(String, String), ClusterError> {
        let namespace = role
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| ClusterError::invalid(format!("role '{}' has no namespace", role.metadata.name)))?;
        Ok((namespace, role.metadata.name.clone()))
    }
}

fn subscribe<R>(sender: &broadcast::Sender<WatchEvent<R>>) -> WatchStream<R>
where
    R: Clone + Send + 'static,
{
    BroadcastStream::new(sender.subscribe())
        .filter_map(|event| async move { event.ok() })
        .boxed()
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        self.namespace(name)
            .await
            .ok_or_else(|| ClusterError::not_found(Namespace::KIND, name))
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError> {
        self.role(namespace, name)
            .await
            .ok_or_else(|| ClusterError::not_found(Role::KIND, format!("{namespace}/{name}")))
    }

    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let key = Self::role_key(role)?;
        let mut state = self.state.lock().await;

        if let Some(error) = state.failing_writes.pop_front() {
            return Err(error);
        }
        if !state.namespaces.contains_key(&key.0) {
            return Err(ClusterError::not_found(Namespace::KIND, key.0));
        }
        if state.roles.contains_key(&key) {
            return Err(ClusterError::already_exists(
                Role::KIND,
                format!("{}/{}", key.0, key.1),
            ));
        }

        let mut created = role.clone();
        created.metadata.uid = Some(state.next_uid());
        created.metadata.resource_version = Some(state.next_version());
        state.roles.insert(key, created.clone());
        state.mutations.creates = state.mutations.creates.saturating_add(1);
        drop(state);

        debug!(role = %created.key(), "Created role");
        let _ = self.role_events.send(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let key = Self::role_key(role)?;
        let mut state = self.state.lock().await;

        if let Some(error) = state.failing_writes.pop_front() {
            return Err(error);
        }
        let current = state.roles.get(&key).cloned().ok_or_else(|| {
            ClusterError::not_found(Role::KIND, format!("{}/{}", key.0, key.1))
        })?;
        if role.metadata.resource_version.is_some()
            && role.metadata.resource_version != current.metadata.resource_version
        {
            return Err(ClusterError::conflict(
                Role::KIND,
                format!("{}/{}", key.0, key.1),
            ));
        }

        let mut updated = role.clone();
        updated.metadata.uid = current.metadata.uid;
        updated.metadata.resource_version = Some(state.next_version());
        state.roles.insert(key, updated.clone());
        state.mutations.updates = state.mutations.updates.saturating_add(1);
        drop(state);

        debug!(role = %updated.key(), "Updated role");
        let _ = self.role_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    fn watch_namespaces(&self) -> WatchStream<Namespace> {
        subscribe(&self.namespace_events)
    }

    fn watch_roles(&self) -> WatchStream<Role> {
        subscribe(&self.role_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebb_events::ObjectMeta;

    #[tokio::test]
    async fn test_get_missing_namespace_is_not_found() {
        let cluster = InMemoryCluster::new();
        let result = cluster.get_namespace("team-a").await;
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_create_role_twice_conflicts() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("team-a").await;
        let role = Role::new("team-a", "reader");

        assert!(cluster.create_role(&role).await.is_ok());
        assert!(matches!(
            cluster.create_role(&role).await,
            Err(ClusterError::AlreadyExists { .. })
        ));
        assert_eq!(cluster.mutations().await.creates, 1);
    }

    #[tokio::test]
    async fn test_create_role_in_missing_namespace() {
        let cluster = InMemoryCluster::new();
        let result = cluster.create_role(&Role::new("ghost", "reader")).await;
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() -> Result<(), ClusterError> {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("team-a").await;
        let created = cluster.create_role(&Role::new("team-a", "reader")).await?;

        cluster.update_role(&created).await?;
        assert!(matches!(
            cluster.update_role(&created).await,
            Err(ClusterError::Conflict { .. })
        ));
        assert_eq!(cluster.mutations().await, Mutations { creates: 1, updates: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn test_role_without_namespace_is_invalid() {
        let cluster = InMemoryCluster::new();
        let role = Role {
            metadata: ObjectMeta::named("reader"),
            rules: Vec::new(),
        };
        assert!(matches!(
            cluster.create_role(&role).await,
            Err(ClusterError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("team-a").await;
        cluster
            .fail_next_writes(ClusterError::unavailable("etcd timeout"), 1)
            .await;

        let role = Role::new("team-a", "reader");
        assert!(matches!(
            cluster.create_role(&role).await,
            Err(ClusterError::Unavailable { .. })
        ));
        assert!(cluster.create_role(&role).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_streams_events() {
        let cluster = InMemoryCluster::new();
        let mut namespaces = cluster.watch_namespaces();
        let mut roles = cluster.watch_roles();

        cluster.create_namespace("team-a").await;
        let _ = cluster.create_role(&Role::new("team-a", "reader")).await;
        cluster.delete_namespace("team-a").await;

        assert_eq!(
            namespaces.next().await.map(|e| e.event_type()),
            Some("added")
        );
        assert_eq!(
            namespaces.next().await.map(|e| e.event_type()),
            Some("deleted")
        );
        assert_eq!(roles.next().await.map(|e| e.event_type()), Some("added"));
        assert_eq!(roles.next().await.map(|e| e.event_type()), Some("deleted"));
    }
}
