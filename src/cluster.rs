//! [`ClusterApi`] backed by a real Kubernetes API server.
//!
//! Converts between `k8s-openapi` wire types and the bridge's resource model.
//! Watches go through `kube::runtime::watcher` with its default backoff, so
//! a broken watch reconnects instead of ending the stream.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ebb_events::{
    Namespace, NamespacePhase, ObjectMeta, OwnerReference, PolicyRule, Role, WatchEvent,
};
use ebb_reconciler::{ClusterApi, ClusterError, MANAGED_BY_LABEL, MANAGED_BY_VALUE, WatchStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use k8s_openapi::api::rbac::v1::{PolicyRule as KubePolicyRule, Role as KubeRole};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta as KubeObjectMeta, OwnerReference as KubeOwnerReference,
};
use kube::Client;
use kube::api::{Api, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use tracing::warn;

/// Cluster access through a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster config or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable client configuration is found.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }

    fn namespaces(&self) -> Api<KubeNamespace> {
        Api::all(self.client.clone())
    }

    fn roles(&self, namespace: &str) -> Api<KubeRole> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        self.namespaces()
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, Op::Read, "Namespace", name))?
            .map(namespace_from_kube)
            .ok_or_else(|| ClusterError::not_found("Namespace", name))
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Role, ClusterError> {
        let qualified = format!("{namespace}/{name}");
        self.roles(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, Op::Read, "Role", &qualified))?
            .map(role_from_kube)
            .ok_or_else(|| ClusterError::not_found("Role", qualified))
    }

    async fn create_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let namespace = role_namespace(role)?;
        let qualified = format!("{namespace}/{}", role.metadata.name);
        self.roles(namespace)
            .create(&PostParams::default(), &role_to_kube(role))
            .await
            .map(role_from_kube)
            .map_err(|e| map_error(e, Op::Create, "Role", &qualified))
    }

    async fn update_role(&self, role: &Role) -> Result<Role, ClusterError> {
        let namespace = role_namespace(role)?;
        let qualified = format!("{namespace}/{}", role.metadata.name);
        self.roles(namespace)
            .replace(&role.metadata.name, &PostParams::default(), &role_to_kube(role))
            .await
            .map(role_from_kube)
            .map_err(|e| map_error(e, Op::Replace, "Role", &qualified))
    }

    fn watch_namespaces(&self) -> WatchStream<Namespace> {
        watcher(self.namespaces(), watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move { convert_event(event, namespace_from_kube) })
            .boxed()
    }

    fn watch_roles(&self) -> WatchStream<Role> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let api: Api<KubeRole> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default().labels(&selector))
            .default_backoff()
            .filter_map(|event| async move { convert_event(event, role_from_kube) })
            .boxed()
    }
}

/// What the failed request was trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Create,
    Replace,
}

fn map_error(err: kube::Error, op: Op, kind: &str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::not_found(kind, name),
            409 if op == Op::Create => ClusterError::already_exists(kind, name),
            409 => ClusterError::conflict(kind, name),
            400 | 422 => ClusterError::invalid(response.message),
            code => ClusterError::unavailable(format!(
                "{code} {}: {}",
                response.reason, response.message
            )),
        },
        other => ClusterError::unavailable(other.to_string()),
    }
}

fn role_namespace(role: &Role) -> Result<&str, ClusterError> {
    role.metadata
        .namespace
        .as_deref()
        .ok_or_else(|| {
            ClusterError::invalid(format!("Role '{}' has no namespace", role.metadata.name))
        })
}

fn convert_event<K, R>(
    event: std::result::Result<watcher::Event<K>, watcher::Error>,
    convert: fn(K) -> R,
) -> Option<WatchEvent<R>> {
    match event {
        Ok(watcher::Event::InitApply(object)) => Some(WatchEvent::Added(convert(object))),
        Ok(watcher::Event::Apply(object)) => Some(WatchEvent::Modified(convert(object))),
        Ok(watcher::Event::Delete(object)) => Some(WatchEvent::Deleted(convert(object))),
        Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
        Err(e) => {
            warn!(error = %e, "Watch error, retrying");
            None
        }
    }
}

fn meta_from_kube(meta: KubeObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace,
        uid: meta.uid,
        resource_version: meta.resource_version,
        labels: meta.labels.unwrap_or_default(),
        owner_references: meta
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(|r| OwnerReference {
                api_version: r.api_version,
                kind: r.kind,
                name: r.name,
                uid: r.uid,
                controller: r.controller.unwrap_or(false),
                block_owner_deletion: r.block_owner_deletion.unwrap_or(false),
            })
            .collect(),
        deletion_timestamp: meta.deletion_timestamp.map(|t| t.0),
    }
}

fn meta_to_kube(meta: &ObjectMeta) -> KubeObjectMeta {
    let owners: Vec<KubeOwnerReference> = meta
        .owner_references
        .iter()
        .map(|r| KubeOwnerReference {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
            controller: Some(r.controller),
            block_owner_deletion: Some(r.block_owner_deletion),
        })
        .collect();

    KubeObjectMeta {
        name: Some(meta.name.clone()),
        namespace: meta.namespace.clone(),
        resource_version: meta.resource_version.clone(),
        labels: non_empty_map(&meta.labels),
        owner_references: (!owners.is_empty()).then_some(owners),
        ..KubeObjectMeta::default()
    }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn non_empty(items: &[String]) -> Option<Vec<String>> {
    (!items.is_empty()).then(|| items.to_vec())
}

fn namespace_from_kube(namespace: KubeNamespace) -> Namespace {
    let phase = match namespace.status.and_then(|s| s.phase).as_deref() {
        Some("Terminating") => NamespacePhase::Terminating,
        _ => NamespacePhase::Active,
    };
    Namespace {
        metadata: meta_from_kube(namespace.metadata),
        phase,
    }
}

fn role_from_kube(role: KubeRole) -> Role {
    let rules = role
        .rules
        .unwrap_or_default()
        .into_iter()
        .map(|r| PolicyRule {
            api_groups: r.api_groups.unwrap_or_default(),
            resources: r.resources.unwrap_or_default(),
            resource_names: r.resource_names.unwrap_or_default(),
            verbs: r.verbs,
        })
        .collect();
    Role {
        metadata: meta_from_kube(role.metadata),
        rules,
    }
}

fn role_to_kube(role: &Role) -> KubeRole {
    KubeRole {
        metadata: meta_to_kube(&role.metadata),
        rules: Some(
            role.rules
                .iter()
                .map(|r| KubePolicyRule {
                    api_groups: non_empty(&r.api_groups),
                    resources: non_empty(&r.resources),
                    resource_names: non_empty(&r.resource_names),
                    non_resource_urls: None,
                    verbs: r.verbs.clone(),
                })
                .collect(),
        ),
    }
}
