//! Resource model shared by the router, the reconciler and the cluster
//! adapters.
//!
//! Only the fields the bridge actually reads are modelled. Adapters convert
//! from their wire types (for example `k8s-openapi`) into these.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ObjectKey;

/// Reference from an owned resource to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    /// API version of the owner, e.g. `v1`.
    pub api_version: String,
    /// Kind of the owner, e.g. `Namespace`.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// Uid of the owner.
    pub uid: String,
    /// Whether the owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
    /// Whether the owner cannot be deleted before this resource.
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Metadata common to every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the namespace.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the uid.
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }
}

/// A typed resource the bridge can watch and reconcile.
pub trait Resource: Clone + Send + Sync + 'static {
    /// `group/version`, or just `version` for the core group.
    const API_VERSION: &'static str;
    /// Kind name, e.g. `Namespace`.
    const KIND: &'static str;
    /// Whether instances live inside a namespace.
    const NAMESPACED: bool;

    /// Resource metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Work item key of this resource.
    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey {
            namespace: meta.namespace.clone().filter(|_| Self::NAMESPACED),
            name: meta.name.clone(),
        }
    }

    /// The owner reference flagged as managing controller, if any.
    fn controller_owner(&self) -> Option<&OwnerReference> {
        self.meta().owner_references.iter().find(|r| r.controller)
    }

    /// Build a controller owner reference pointing at this resource.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingUid` if the resource has not been persisted yet.
    fn controller_reference(&self) -> Result<OwnerReference> {
        let meta = self.meta();
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::missing_uid(Self::KIND, &meta.name))?;

        Ok(OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: meta.name.clone(),
            uid,
            controller: true,
            block_owner_deletion: true,
        })
    }
}

/// API group part of an `apiVersion` (empty for the core group).
pub fn api_group(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map_or("", |(group, _version)| group)
}

/// Lifecycle phase of a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespacePhase {
    #[default]
    Active,
    Terminating,
}

/// The primary resource: a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub phase: NamespacePhase,
}

impl Namespace {
    /// An active namespace with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            phase: NamespacePhase::Active,
        }
    }

    /// Whether the namespace is going away.
    pub const fn is_terminating(&self) -> bool {
        matches!(self.phase, NamespacePhase::Terminating) || self.metadata.deletion_timestamp.is_some()
    }
}

impl Resource for Namespace {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Namespace";
    const NAMESPACED: bool = false;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// One RBAC policy rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    pub verbs: Vec<String>,
}

impl PolicyRule {
    /// A rule granting `verbs`.
    pub fn new<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verbs: verbs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Restrict the rule to API groups.
    #[must_use]
    pub fn api_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the rule to resources.
    #[must_use]
    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

/// The owned resource: a namespaced RBAC Role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Role {
    /// A role without rules.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name).in_namespace(namespace),
            rules: Vec::new(),
        }
    }
}

impl Resource for Role {
    const API_VERSION: &'static str = "rbac.authorization.k8s.io/v1";
    const KIND: &'static str = "Role";
    const NAMESPACED: bool = true;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}
