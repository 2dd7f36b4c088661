//! Common test utilities for reconciler integration tests
//!
//! - `FakeCluster`: in-memory object store with resource versions,
//!   finalizer-gated deletion and merge-patched status
//! - `FakeIdentity`: in-memory keystone recording every call it receives

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use keystone_operator::cluster::{
    get_typed, Cluster, ClusterError, FinalizerUpdate, ObjectRef, ResourceKind, Workload,
    WorkloadState,
};
use keystone_operator::config::ControllerConfig;
use keystone_operator::controller::Context;
use keystone_operator::crd::{Condition, ConditionStatus, ConditionType};
use keystone_operator::identity::{
    AdminCredentials, IdentityBackend, IdentityConnector, IdentityError, Project, Role,
    ServiceEntity, ServiceRequest, User, UserRequest,
};
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "openstack";

#[derive(Default)]
struct Store {
    objects: BTreeMap<ObjectRef, Value>,
    secrets: BTreeMap<(String, String), Secret>,
    workloads: BTreeMap<String, Workload>,
    workload_states: BTreeMap<String, WorkloadState>,
    status_patches: usize,
    next_version: u64,
}

impl Store {
    fn bump(&mut self, obj: &mut Value) -> String {
        self.next_version += 1;
        let version = self.next_version.to_string();
        obj["metadata"]["resourceVersion"] = json!(version);
        version
    }
}

/// In-memory [`Cluster`]
#[derive(Default)]
pub struct FakeCluster {
    store: Mutex<Store>,
    /// Panic inside the next secret read
    pub panic_on_secret: AtomicBool,
}

fn finalizers_of(obj: &Value) -> Vec<String> {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn deleting(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp")
        .is_some_and(|ts| !ts.is_null())
}

fn to_dynamic(obj: &Value) -> DynamicObject {
    serde_json::from_value(obj.clone()).unwrap()
}

impl FakeCluster {
    /// Store a typed object as-is, keeping its status
    pub fn insert<K: Serialize>(&self, kind: ResourceKind, resource: &K) -> ObjectRef {
        let mut obj = serde_json::to_value(resource).unwrap();
        let namespace = obj["metadata"]["namespace"]
            .as_str()
            .unwrap_or(NAMESPACE)
            .to_string();
        let name = obj["metadata"]["name"].as_str().unwrap().to_string();
        obj["metadata"]["namespace"] = json!(namespace);
        let target = ObjectRef::new(kind, &namespace, &name);
        let mut store = self.store.lock().unwrap();
        store.bump(&mut obj);
        store.objects.insert(target.clone(), obj);
        target
    }

    /// Store a foreign dependent with the given status
    pub fn insert_dependent(&self, kind: ResourceKind, name: &str, spec: Value, status: Value) -> ObjectRef {
        let resource = kind.api_resource();
        let obj = json!({
            "apiVersion": resource.api_version,
            "kind": resource.kind,
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": spec,
            "status": status,
        });
        self.insert(kind, &obj)
    }

    /// Status of a dependent reporting Ready=True
    #[must_use]
    pub fn ready_status(extra: Value) -> Value {
        let mut status = json!({"conditions": [{"type": "Ready", "status": "True"}]});
        if let (Some(status), Some(extra)) = (status.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                status.insert(key.clone(), value.clone());
            }
        }
        status
    }

    pub fn object(&self, target: &ObjectRef) -> Option<Value> {
        self.store.lock().unwrap().objects.get(target).cloned()
    }

    pub fn typed<K: DeserializeOwned>(&self, target: &ObjectRef) -> K {
        serde_json::from_value(self.object(target).expect("object exists")).unwrap()
    }

    pub fn finalizers(&self, target: &ObjectRef) -> Vec<String> {
        self.object(target).map(|o| finalizers_of(&o)).unwrap_or_default()
    }

    /// Edit an object in place, as a user or another controller would
    pub fn update(&self, target: &ObjectRef, edit: impl FnOnce(&mut Value)) {
        let mut store = self.store.lock().unwrap();
        let mut obj = store.objects.get(target).cloned().expect("object exists");
        edit(&mut obj);
        store.bump(&mut obj);
        store.objects.insert(target.clone(), obj);
    }

    /// Change the spec and bump the generation
    pub fn update_spec(&self, target: &ObjectRef, edit: impl FnOnce(&mut Value)) {
        self.update(target, |obj| {
            edit(&mut obj["spec"]);
            let generation = obj["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
            obj["metadata"]["generation"] = json!(generation);
        });
    }

    /// Request deletion; the object stays until its finalizers are gone
    pub fn request_deletion(&self, target: &ObjectRef) {
        if self.finalizers(target).is_empty() {
            self.store.lock().unwrap().objects.remove(target);
            return;
        }
        self.update(target, |obj| {
            obj["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        });
    }

    pub fn put_secret(&self, name: &str, fields: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        };
        self.store
            .lock()
            .unwrap()
            .secrets
            .insert((NAMESPACE.to_string(), name.to_string()), secret);
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.store
            .lock()
            .unwrap()
            .secrets
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn edit_secret(&self, name: &str, edit: impl FnOnce(&mut Secret)) {
        let mut store = self.store.lock().unwrap();
        let secret = store
            .secrets
            .get_mut(&(NAMESPACE.to_string(), name.to_string()))
            .expect("secret exists");
        edit(secret);
    }

    /// State reported for the workload named `name` from now on
    pub fn set_workload_state(&self, name: &str, state: WorkloadState) {
        self.store
            .lock()
            .unwrap()
            .workload_states
            .insert(name.to_string(), state);
    }

    pub fn workload(&self, name: &str) -> Option<Workload> {
        self.store.lock().unwrap().workloads.get(name).cloned()
    }

    pub fn status_patches(&self) -> usize {
        self.store.lock().unwrap().status_patches
    }

    fn write_finalizer(&self, target: &ObjectRef, token: &str, add: bool) -> FinalizerUpdate {
        let mut store = self.store.lock().unwrap();
        let Some(mut obj) = store.objects.get(target).cloned() else {
            return FinalizerUpdate::absent();
        };
        let is_deleting = deleting(&obj);
        let mut finalizers = finalizers_of(&obj);
        let has_token = finalizers.iter().any(|f| f == token);
        let unchanged = if add { has_token || is_deleting } else { !has_token };
        if unchanged {
            return FinalizerUpdate {
                present: true,
                deleting: is_deleting,
                changed: false,
                resource_version: obj["metadata"]["resourceVersion"].as_str().map(str::to_string),
            };
        }

        if add {
            finalizers.push(token.to_string());
        } else {
            finalizers.retain(|f| f != token);
        }
        if is_deleting && finalizers.is_empty() {
            store.objects.remove(target);
            return FinalizerUpdate {
                present: true,
                deleting: true,
                changed: true,
                resource_version: None,
            };
        }
        obj["metadata"]["finalizers"] = json!(finalizers);
        let version = store.bump(&mut obj);
        store.objects.insert(target.clone(), obj);
        FinalizerUpdate {
            present: true,
            deleting: is_deleting,
            changed: true,
            resource_version: Some(version),
        }
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self.object(target).as_ref().map(to_dynamic))
    }

    async fn apply(&self, target: &ObjectRef, body: Value) -> Result<DynamicObject, ClusterError> {
        let mut store = self.store.lock().unwrap();
        let mut obj = match store.objects.get(target) {
            Some(existing) => {
                let mut merged = existing.clone();
                if let Some(fields) = body.as_object() {
                    for (key, value) in fields {
                        if key != "metadata" && key != "status" {
                            merged[key.as_str()] = value.clone();
                        }
                    }
                }
                merged
            }
            None => {
                let mut created = body.clone();
                created["metadata"]["name"] = json!(target.name);
                created["metadata"]["namespace"] = json!(target.namespace);
                created
            }
        };
        store.bump(&mut obj);
        store.objects.insert(target.clone(), obj.clone());
        Ok(to_dynamic(&obj))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(target, _)| target.kind == kind && target.namespace == namespace)
            .map(|(_, obj)| to_dynamic(obj))
            .collect())
    }

    async fn add_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError> {
        Ok(self.write_finalizer(target, token, true))
    }

    async fn remove_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError> {
        Ok(self.write_finalizer(target, token, false))
    }

    async fn patch_status(
        &self,
        target: &ObjectRef,
        resource_version: Option<&str>,
        patch: Value,
    ) -> Result<(), ClusterError> {
        let mut store = self.store.lock().unwrap();
        let Some(mut obj) = store.objects.get(target).cloned() else {
            return Err(ClusterError::Conflict(format!("{} is gone", target)));
        };
        if let Some(expected) = resource_version {
            if obj["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(ClusterError::Conflict(target.to_string()));
            }
        }
        if obj.get("status").is_none_or(Value::is_null) {
            obj["status"] = json!({});
        }
        json_patch::merge(&mut obj["status"], &patch);
        store.bump(&mut obj);
        store.status_patches += 1;
        store.objects.insert(target.clone(), obj);
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        if self.panic_on_secret.swap(false, Ordering::SeqCst) {
            panic!("secret store exploded");
        }
        Ok(self
            .store
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.store.lock().unwrap().secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn apply_workload(
        &self,
        _namespace: &str,
        workload: &Workload,
    ) -> Result<WorkloadState, ClusterError> {
        let mut store = self.store.lock().unwrap();
        let name = workload.name().to_string();
        store.workloads.insert(name.clone(), workload.clone());
        Ok(store
            .workload_states
            .get(&name)
            .cloned()
            .unwrap_or(WorkloadState::Ready { ready_replicas: 1 }))
    }
}

#[derive(Default)]
struct Keystone {
    services: Vec<ServiceEntity>,
    projects: Vec<Project>,
    users: Vec<User>,
    roles: Vec<Role>,
    assignments: Vec<(String, String, String)>,
    calls: Vec<String>,
    next_id: usize,
}

impl Keystone {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory keystone; every session shares the same state
#[derive(Default, Clone)]
pub struct FakeIdentity {
    keystone: Arc<Mutex<Keystone>>,
}

impl FakeIdentity {
    pub fn calls(&self) -> Vec<String> {
        self.keystone.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn services(&self) -> Vec<ServiceEntity> {
        self.keystone.lock().unwrap().services.clone()
    }

    pub fn users(&self) -> Vec<User> {
        self.keystone.lock().unwrap().users.clone()
    }

    pub fn assignments(&self) -> usize {
        self.keystone.lock().unwrap().assignments.len()
    }

    pub fn seed_service(&self, service_type: &str, name: &str, description: &str, enabled: bool) -> String {
        let mut keystone = self.keystone.lock().unwrap();
        let id = keystone.id("service");
        keystone.services.push(ServiceEntity {
            id: id.clone(),
            service_type: service_type.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            enabled,
        });
        id
    }

    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, Keystone> {
        let mut keystone = self.keystone.lock().unwrap();
        keystone.calls.push(call.to_string());
        keystone
    }
}

#[async_trait]
impl IdentityConnector for FakeIdentity {
    async fn connect(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<Arc<dyn IdentityBackend>, IdentityError> {
        drop(self.record("connect"));
        if credentials.password.is_empty() {
            return Err(IdentityError::Fatal("authentication failed".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl IdentityBackend for FakeIdentity {
    async fn get_service(
        &self,
        service_type: &str,
        name: &str,
    ) -> Result<ServiceEntity, IdentityError> {
        self.record("get_service")
            .services
            .iter()
            .find(|s| s.service_type == service_type && s.name == name)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("service {}", name)))
    }

    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceEntity, IdentityError> {
        let mut keystone = self.record("create_service");
        let service = ServiceEntity {
            id: keystone.id("service"),
            service_type: request.service_type.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            enabled: request.enabled,
        };
        keystone.services.push(service.clone());
        Ok(service)
    }

    async fn update_service(
        &self,
        id: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceEntity, IdentityError> {
        let mut keystone = self.record("update_service");
        let service = keystone
            .services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| IdentityError::NotFound(format!("service {}", id)))?;
        service.description.clone_from(&request.description);
        service.enabled = request.enabled;
        Ok(service.clone())
    }

    async fn delete_service(&self, id: &str) -> Result<(), IdentityError> {
        let mut keystone = self.record("delete_service");
        let before = keystone.services.len();
        keystone.services.retain(|s| s.id != id);
        if keystone.services.len() == before {
            return Err(IdentityError::NotFound(format!("service {}", id)));
        }
        Ok(())
    }

    async fn get_project(&self, name: &str, _domain_id: &str) -> Result<Project, IdentityError> {
        self.record("get_project")
            .projects
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("project {}", name)))
    }

    async fn create_project(&self, name: &str, domain_id: &str) -> Result<Project, IdentityError> {
        let mut keystone = self.record("create_project");
        let project = Project {
            id: keystone.id("project"),
            name: name.to_string(),
            domain_id: domain_id.to_string(),
        };
        keystone.projects.push(project.clone());
        Ok(project)
    }

    async fn get_user(&self, name: &str, _domain_id: &str) -> Result<User, IdentityError> {
        self.record("get_user")
            .users
            .iter()
            .find(|u| u.name == name)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("user {}", name)))
    }

    async fn create_user(&self, request: &UserRequest) -> Result<User, IdentityError> {
        let mut keystone = self.record("create_user");
        let user = User {
            id: keystone.id("user"),
            name: request.name.clone(),
            domain_id: request.domain_id.clone(),
            default_project_id: Some(request.default_project_id.clone()),
        };
        keystone.users.push(user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> Result<(), IdentityError> {
        let mut keystone = self.record("delete_user");
        keystone.users.retain(|u| u.id != id);
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<Role, IdentityError> {
        self.record("get_role")
            .roles
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("role {}", name)))
    }

    async fn create_role(&self, name: &str) -> Result<Role, IdentityError> {
        let mut keystone = self.record("create_role");
        let role = Role {
            id: keystone.id("role"),
            name: name.to_string(),
        };
        keystone.roles.push(role.clone());
        Ok(role)
    }

    async fn assign_user_role(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), IdentityError> {
        let mut keystone = self.record("assign_user_role");
        let grant = (project_id.to_string(), user_id.to_string(), role_id.to_string());
        if !keystone.assignments.contains(&grant) {
            keystone.assignments.push(grant);
        }
        Ok(())
    }
}

pub fn context(cluster: &Arc<FakeCluster>, identity: &FakeIdentity) -> Arc<Context> {
    Arc::new(Context::new(
        cluster.clone(),
        Arc::new(identity.clone()),
        ControllerConfig::default(),
    ))
}

/// Fetch the current state of `target` the way the watcher would hand it over
pub async fn fetch<K: DeserializeOwned>(cluster: &FakeCluster, target: &ObjectRef) -> Arc<K> {
    Arc::new(
        get_typed(cluster, target)
            .await
            .unwrap()
            .expect("object exists"),
    )
}

pub fn condition(conditions: &[Condition], type_: ConditionType) -> Condition {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .cloned()
        .unwrap_or_else(|| panic!("condition {} missing", type_))
}

pub fn status_of(conditions: &[Condition], type_: ConditionType) -> ConditionStatus {
    condition(conditions, type_).status
}
