//! # Cluster Store
//!
//! Everything a reconciliation reads from or writes to the cluster goes
//! through the [`Cluster`] trait: dependent custom resources, secrets,
//! finalizers, workloads and status patches. [`KubeCluster`] is the
//! API-server implementation; tests substitute an in-memory store.
//!
//! Dependents owned by other operators (MariaDB, RabbitMQ, Memcached,
//! Topology, Multus) are handled as `DynamicObject`s so this crate does not
//! depend on their Rust types.

mod kube_store;
pub mod secrets;

pub use kube_store::KubeCluster;

use crate::crd::{KeystoneAPI, KeystoneService};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    /// Optimistic-concurrency collision, retry immediately
    #[error("Conflict writing {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kinds of objects addressed through [`ObjectRef`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    KeystoneApi,
    KeystoneService,
    MariaDbDatabase,
    MariaDbAccount,
    TransportUrl,
    Memcached,
    Topology,
    NetworkAttachmentDefinition,
}

impl ResourceKind {
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::KeystoneApi => ApiResource::erase::<KeystoneAPI>(&()),
            ResourceKind::KeystoneService => ApiResource::erase::<KeystoneService>(&()),
            ResourceKind::MariaDbDatabase => foreign(
                "mariadb.openstack.org",
                "v1beta1",
                "MariaDBDatabase",
                "mariadbdatabases",
            ),
            ResourceKind::MariaDbAccount => foreign(
                "mariadb.openstack.org",
                "v1beta1",
                "MariaDBAccount",
                "mariadbaccounts",
            ),
            ResourceKind::TransportUrl => foreign(
                "rabbitmq.openstack.org",
                "v1beta1",
                "TransportURL",
                "transporturls",
            ),
            ResourceKind::Memcached => foreign(
                "memcached.openstack.org",
                "v1beta1",
                "Memcached",
                "memcacheds",
            ),
            ResourceKind::Topology => foreign(
                "topology.openstack.org",
                "v1beta1",
                "Topology",
                "topologies",
            ),
            ResourceKind::NetworkAttachmentDefinition => foreign(
                "k8s.cni.cncf.io",
                "v1",
                "NetworkAttachmentDefinition",
                "network-attachment-definitions",
            ),
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> String {
        self.api_resource().kind
    }
}

fn foreign(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

/// Address of one namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    #[must_use]
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind.kind_name(), self.namespace, self.name)
    }
}

/// Result of adding or removing a finalizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizerUpdate {
    /// The target exists
    pub present: bool,
    /// The target carries a deletion timestamp
    pub deleting: bool,
    /// The finalizer list was written
    pub changed: bool,
    /// Resource version after the operation
    pub resource_version: Option<String>,
}

impl FinalizerUpdate {
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }
}

/// A workload the operator renders and applies
#[derive(Debug, Clone)]
pub enum Workload {
    /// One-shot Job, recreated when its hash label changes
    Job(Job),
    Deployment(Deployment),
    CronJob(CronJob),
    Service(Service),
}

impl Workload {
    #[must_use]
    pub fn name(&self) -> &str {
        let meta = match self {
            Workload::Job(w) => &w.metadata,
            Workload::Deployment(w) => &w.metadata,
            Workload::CronJob(w) => &w.metadata,
            Workload::Service(w) => &w.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }
}

/// Readiness of an applied workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadState {
    Ready { ready_replicas: i32 },
    Progressing(String),
    Failed(String),
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError>;

    /// Server-side apply `body` (a complete object manifest)
    async fn apply(&self, target: &ObjectRef, body: Value) -> Result<DynamicObject, ClusterError>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Add `token` to the target's finalizers; set semantics, absent target is not an error
    async fn add_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError>;

    /// Remove `token` from the target's finalizers; absent target is not an error
    async fn remove_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError>;

    /// Merge-patch the status subresource, failing with `Conflict` when
    /// `resource_version` is set and no longer current
    async fn patch_status(
        &self,
        target: &ObjectRef,
        resource_version: Option<&str>,
        patch: Value,
    ) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;

    async fn apply_secret(&self, secret: &Secret) -> Result<(), ClusterError>;

    async fn apply_workload(
        &self,
        namespace: &str,
        workload: &Workload,
    ) -> Result<WorkloadState, ClusterError>;
}

/// Fetch an object and decode it into a typed resource
pub async fn get_typed<K: DeserializeOwned>(
    cluster: &dyn Cluster,
    target: &ObjectRef,
) -> Result<Option<K>, ClusterError> {
    match cluster.get(target).await? {
        Some(obj) => Ok(Some(serde_json::from_value(serde_json::to_value(obj)?)?)),
        None => Ok(None),
    }
}

/// Whether a dependent reports a `Ready` condition with status `True`
#[must_use]
pub fn is_ready(obj: &DynamicObject) -> bool {
    obj.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

#[must_use]
pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Build a JSON merge patch (RFC 7386) turning `old` into `new`
///
/// Keys missing from `new` become explicit nulls so fields cleared by the
/// reconciliation are actually removed from the stored status.
#[must_use]
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), merge_patch(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_clears_removed_fields() {
        let old = json!({"hash": {"input": "a", "dbsync": "b"}, "lastAppliedTopology": {"name": "a"}});
        let new = json!({"hash": {"input": "c"}});
        assert_eq!(
            merge_patch(&old, &new),
            json!({"hash": {"input": "c", "dbsync": null}, "lastAppliedTopology": null})
        );
    }

    #[test]
    fn test_merge_patch_replaces_arrays_whole() {
        let old = json!({"conditions": [1, 2]});
        let new = json!({"conditions": [1]});
        assert_eq!(merge_patch(&old, &new), json!({"conditions": [1]}));
    }

    #[test]
    fn test_foreign_kinds_resolve_plurals() {
        let ar = ResourceKind::Topology.api_resource();
        assert_eq!(ar.plural, "topologies");
        assert_eq!(ar.api_version, "topology.openstack.org/v1beta1");
        assert_eq!(ResourceKind::KeystoneApi.kind_name(), "KeystoneAPI");
    }
}
