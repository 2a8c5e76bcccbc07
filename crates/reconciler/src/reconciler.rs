//! Namespace reconciler.
//!
//! Level-triggered: every call fetches the namespace fresh and converges its
//! Role toward the template, whatever event caused the call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ebb_events::{
    Namespace, ObjectKey, ObjectMeta, OwnerReference, PolicyRule, Resource, Role,
    validate_dns_label,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};

/// Label marking the roles this bridge manages.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on managed roles.
pub const MANAGED_BY_VALUE: &str = "ebb";

/// What the controller should do with a key after a reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; reset the key's backoff.
    Succeeded,
    /// Converged; look again after the delay.
    Requeue(Duration),
    /// Lost a write race; retry now without growing the backoff.
    RequeueImmediate,
    /// Failed; retry with backoff.
    Error(String),
}

impl ReconcileOutcome {
    /// Fold a reconcile result into an outcome.
    pub fn from_result(result: Result<Self>) -> Self {
        result.unwrap_or_else(|e| Self::Error(e.to_string()))
    }

    /// Short name for logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Requeue(_) => "requeue",
            Self::RequeueImmediate => "requeue_immediate",
            Self::Error(_) => "error",
        }
    }
}

/// Business logic invoked by the controller workers.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Converge the resource behind `key`.
    ///
    /// An `Err` is treated like [`ReconcileOutcome::Error`].
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome>;
}

/// The Role every active namespace should contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTemplate {
    #[serde(default = "default_role_name")]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_rules")]
    pub rules: Vec<PolicyRule>,
}

impl Default for RoleTemplate {
    fn default() -> Self {
        Self {
            name: default_role_name(),
            labels: BTreeMap::new(),
            rules: default_rules(),
        }
    }
}

impl RoleTemplate {
    /// Validate the template.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid name or a rule without
    /// verbs.
    pub fn validate(&self) -> Result<()> {
        validate_dns_label(&self.name)
            .map_err(|e| Error::invalid_config("reconciler.role.name", e.to_string()))?;

        if self.rules.iter().any(|rule| rule.verbs.is_empty()) {
            return Err(Error::invalid_config(
                "reconciler.role.rules",
                "every rule needs at least one verb",
            ));
        }
        Ok(())
    }

    /// The Role `namespace` should contain.
    ///
    /// # Errors
    ///
    /// Returns `Error::Resource` if the namespace has no uid to own the
    /// role with.
    pub fn render(&self, namespace: &Namespace) -> Result<Role> {
        let owner = namespace.controller_reference()?;

        let metadata = self
            .labels
            .iter()
            .fold(
                ObjectMeta::named(&self.name).in_namespace(&namespace.metadata.name),
                |meta, (key, value)| meta.with_label(key, value),
            )
            .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .with_owner(owner);

        Ok(Role {
            metadata,
            rules: self.rules.clone(),
        })
    }
}

fn default_role_name() -> String {
    "namespace-reader".to_string()
}

fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule::new(["get", "list", "watch"])
            .api_groups([""])
            .resources(["pods", "services", "configmaps", "events"]),
    ]
}

/// Configuration for the namespace reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Role to keep in every namespace.
    #[serde(default)]
    pub role: RoleTemplate,
    /// Re-reconcile converged namespaces after this long.
    #[serde(default, with = "ebb_core::duration::opt_secs")]
    pub resync_period: Option<Duration>,
}

impl ReconcilerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.role.validate()?;
        if self.resync_period.is_some_and(|period| period.is_zero()) {
            return Err(Error::invalid_config(
                "reconciler.resync_period",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// What happened to the managed Role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Created,
    Updated,
    Unchanged,
}

impl RoleChange {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Keeps the templated Role present and current in every active namespace.
pub struct NamespaceReconciler<C: ?Sized> {
    cluster: Arc<C>,
    config: ReconcilerConfig,
}

impl<C: ClusterApi + ?Sized> NamespaceReconciler<C> {
    /// Create a reconciler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(cluster: Arc<C>, config: ReconcilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { cluster, config })
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Create or update the managed Role of `namespace`.
    ///
    /// # Errors
    ///
    /// Returns the cluster error of the failed call.
    pub async fn apply_role(&self, namespace: &Namespace) -> Result<RoleChange> {
        let desired = self.config.role.render(namespace)?;

        match self
            .cluster
            .get_role(&namespace.metadata.name, &desired.metadata.name)
            .await
        {
            Ok(current) => match updated_role(&current, desired) {
                Some(updated) => {
                    self.cluster.update_role(&updated).await?;
                    Ok(RoleChange::Updated)
                }
                None => Ok(RoleChange::Unchanged),
            },
            Err(e) if e.is_not_found() => {
                self.cluster.create_role(&desired).await?;
                Ok(RoleChange::Created)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn converged(&self) -> ReconcileOutcome {
        self.config
            .resync_period
            .map_or(ReconcileOutcome::Succeeded, ReconcileOutcome::Requeue)
    }
}

/// `current` brought in line with `desired`, or `None` when nothing differs.
///
/// Labels and plain owner references added by others survive; only the
/// controller reference is replaced.
fn updated_role(current: &Role, desired: Role) -> Option<Role> {
    let labels_match = desired
        .metadata
        .labels
        .iter()
        .all(|(key, value)| current.metadata.labels.get(key) == Some(value));
    let owner_matches = current.controller_owner() == desired.controller_owner();

    if current.rules == desired.rules && labels_match && owner_matches {
        return None;
    }

    let mut labels = current.metadata.labels.clone();
    labels.extend(desired.metadata.labels);

    let controller: Vec<OwnerReference> = desired
        .metadata
        .owner_references
        .into_iter()
        .filter(|r| r.controller)
        .collect();
    let owner_references = current
        .metadata
        .owner_references
        .iter()
        .filter(|r| !r.controller && controller.iter().all(|c| c.uid != r.uid))
        .cloned()
        .chain(controller.clone())
        .collect();

    Some(Role {
        metadata: ObjectMeta {
            labels,
            owner_references,
            ..current.metadata.clone()
        },
        rules: desired.rules,
    })
}

#[async_trait]
impl<C: ClusterApi + ?Sized> Reconcile for NamespaceReconciler<C> {
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        if key.namespace.is_some() {
            warn!(key = %key, "Ignoring namespaced key, namespaces are cluster-scoped");
            return Ok(ReconcileOutcome::Succeeded);
        }

        let namespace = match self.cluster.get_namespace(&key.name).await {
            Ok(namespace) => namespace,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Namespace not found, nothing to reconcile");
                return Ok(ReconcileOutcome::Succeeded);
            }
            Err(e) => return Err(e.into()),
        };

        if namespace.is_terminating() {
            debug!(key = %key, "Namespace is terminating, skipping");
            return Ok(ReconcileOutcome::Succeeded);
        }

        info!(key = %key, "Reconciling");

        match self.apply_role(&namespace).await {
            Ok(change) => {
                info!(
                    key = %key,
                    role = %self.config.role.name,
                    change = change.as_str(),
                    "Reconcile complete"
                );
                Ok(self.converged())
            }
            Err(e) if e.is_conflict() => {
                debug!(key = %key, error = %e, "Write conflict, requeueing");
                Ok(ReconcileOutcome::RequeueImmediate)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, InMemoryCluster};

    fn namespace_with_uid(name: &str) -> Namespace {
        let mut namespace = Namespace::new(name);
        namespace.metadata.uid = Some(format!("uid-{name}"));
        namespace
    }

    #[test]
    fn test_render_owns_role() -> Result<()> {
        let role = RoleTemplate::default().render(&namespace_with_uid("team-a"))?;

        assert_eq!(role.key(), ObjectKey::namespaced("team-a", "namespace-reader"));
        assert_eq!(
            role.metadata.labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
        let owner = role.controller_owner();
        assert_eq!(owner.map(|o| o.kind.as_str()), Some("Namespace"));
        assert_eq!(owner.map(|o| o.uid.as_str()), Some("uid-team-a"));
        Ok(())
    }

    #[test]
    fn test_render_needs_uid() {
        let result = RoleTemplate::default().render(&Namespace::new("team-a"));
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn test_unchanged_role_needs_no_update() -> Result<()> {
        let desired = RoleTemplate::default().render(&namespace_with_uid("team-a"))?;
        let mut current = desired.clone();
        current.metadata.resource_version = Some("7".to_string());
        current
            .metadata
            .labels
            .insert("team".to_string(), "a".to_string());

        assert_eq!(updated_role(&current, desired), None);
        Ok(())
    }

    #[test]
    fn test_drifted_rules_are_restored() -> Result<()> {
        let desired = RoleTemplate::default().render(&namespace_with_uid("team-a"))?;
        let mut current = desired.clone();
        current.metadata.resource_version = Some("7".to_string());
        current.rules = vec![PolicyRule::new(["*"])];
        current
            .metadata
            .labels
            .insert("team".to_string(), "a".to_string());

        let updated = updated_role(&current, desired.clone());
        assert_eq!(updated.as_ref().map(|r| &r.rules), Some(&desired.rules));
        assert_eq!(
            updated
                .as_ref()
                .and_then(|r| r.metadata.resource_version.as_deref()),
            Some("7")
        );
        assert_eq!(
            updated
                .as_ref()
                .and_then(|r| r.metadata.labels.get("team"))
                .map(String::as_str),
            Some("a")
        );
        Ok(())
    }

    #[test]
    fn test_foreign_owners_survive_controller_fix() -> Result<()> {
        let desired = RoleTemplate::default().render(&namespace_with_uid("team-a"))?;
        let foreign = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "audit".to_string(),
            uid: "uid-audit".to_string(),
            controller: false,
            block_owner_deletion: false,
        };
        let mut stale = desired.metadata.owner_references.clone();
        for owner in &mut stale {
            owner.uid = "uid-old".to_string();
        }
        let mut current = desired.clone();
        current.metadata.owner_references = stale;
        current.metadata.owner_references.insert(0, foreign.clone());

        let updated = updated_role(&current, desired.clone());
        let owners = updated.map(|r| r.metadata.owner_references).unwrap_or_default();

        assert_eq!(owners.len(), 2);
        assert!(owners.contains(&foreign));
        assert_eq!(
            owners.iter().find(|r| r.controller).map(|r| r.uid.as_str()),
            Some("uid-team-a")
        );
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconcilerConfig::default().validate().is_ok());

        let zero_resync = ReconcilerConfig {
            resync_period: Some(Duration::ZERO),
            ..ReconcilerConfig::default()
        };
        assert!(zero_resync.validate().is_err());

        let mut bad_name = ReconcilerConfig::default();
        bad_name.role.name = "Not_A_Name".to_string();
        assert!(bad_name.validate().is_err());

        let mut no_verbs = ReconcilerConfig::default();
        no_verbs.role.rules = vec![PolicyRule::default()];
        assert!(no_verbs.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: std::result::Result<ReconcilerConfig, _> = toml::from_str(
            r#"
            resync_period = 300

            [role]
            name = "team-viewer"

            [[role.rules]]
            api_groups = ["apps"]
            resources = ["deployments"]
            verbs = ["get", "list"]
            "#,
        );
        let config = config.ok();
        assert_eq!(
            config.as_ref().and_then(|c| c.resync_period),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.as_ref().map(|c| c.role.name.as_str()), Some("team-viewer"));
        assert_eq!(config.map(|c| c.role.rules.len()), Some(1));
    }

    #[test]
    fn test_outcome_from_error() {
        let outcome = ReconcileOutcome::from_result(Err(Error::from(ClusterError::unavailable(
            "connection refused",
        ))));
        assert!(matches!(outcome, ReconcileOutcome::Error(ref reason) if reason.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_namespaced_key_is_ignored() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = NamespaceReconciler::new(cluster.clone(), ReconcilerConfig::default())?;

        let outcome = reconciler
            .reconcile(&ObjectKey::namespaced("team-a", "team-a"))
            .await?;

        assert_eq!(outcome, ReconcileOutcome::Succeeded);
        assert_eq!(cluster.mutations().await.total(), 0);
        Ok(())
    }
}
