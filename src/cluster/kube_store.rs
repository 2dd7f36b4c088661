//! # Kubernetes-backed Cluster Store

use super::{Cluster, ClusterError, FinalizerUpdate, ObjectRef, ResourceKind, Workload, WorkloadState};
use crate::constants::{FIELD_MANAGER, JOB_HASH_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::DynamicObject;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Default Job backoff limit when the spec does not set one
const JOB_BACKOFF_LIMIT: i32 = 6;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    async fn write_finalizers(
        &self,
        target: &ObjectRef,
        token: &str,
        add: bool,
    ) -> Result<FinalizerUpdate, ClusterError> {
        let api = self.dynamic(target.kind, &target.namespace);
        let Some(obj) = api.get_opt(&target.name).await? else {
            return Ok(FinalizerUpdate::absent());
        };
        let deleting = obj.metadata.deletion_timestamp.is_some();
        let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
        let has_token = finalizers.iter().any(|f| f == token);

        // The API server refuses new finalizers on an object that is going away.
        let unchanged = if add { has_token || deleting } else { !has_token };
        if unchanged {
            return Ok(FinalizerUpdate {
                present: true,
                deleting,
                changed: false,
                resource_version: obj.metadata.resource_version.clone(),
            });
        }

        if add {
            finalizers.push(token.to_string());
        } else {
            finalizers.retain(|f| f != token);
        }
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": obj.metadata.resource_version,
            }
        });
        let updated = match api
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(FinalizerUpdate::absent()),
            Err(e) => return Err(classify(e, target)),
        };
        debug!(
            "{} finalizer {} on {}",
            if add { "Added" } else { "Removed" },
            token,
            target
        );
        Ok(FinalizerUpdate {
            present: true,
            deleting,
            changed: true,
            resource_version: updated.metadata.resource_version,
        })
    }

    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<WorkloadState, ClusterError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let name = job.metadata.name.clone().unwrap_or_default();
        let wanted_hash = label(&job.metadata.labels, JOB_HASH_LABEL);

        let current = match api.get_opt(&name).await? {
            Some(existing) if label(&existing.metadata.labels, JOB_HASH_LABEL) == wanted_hash => {
                existing
            }
            Some(_) => {
                info!("♻️  Job {} inputs changed, recreating", name);
                let params = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Background),
                    ..DeleteParams::default()
                };
                api.delete(&name, &params).await?;
                return Ok(WorkloadState::Progressing(format!(
                    "Job {} is being recreated",
                    name
                )));
            }
            None => api.create(&PostParams::default(), job).await?,
        };
        Ok(job_state(&current))
    }
}

fn label(
    labels: &Option<std::collections::BTreeMap<String, String>>,
    key: &str,
) -> Option<String> {
    labels.as_ref().and_then(|l| l.get(key).cloned())
}

fn classify(error: kube::Error, target: &ObjectRef) -> ClusterError {
    match error {
        kube::Error::Api(ref e) if e.code == 409 => ClusterError::Conflict(target.to_string()),
        other => ClusterError::Kube(other),
    }
}

/// Map Job status onto [`WorkloadState`]
#[must_use]
pub fn job_state(job: &Job) -> WorkloadState {
    let name = job.metadata.name.as_deref().unwrap_or_default();
    let status = job.status.clone().unwrap_or_default();
    let limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(JOB_BACKOFF_LIMIT);
    if status.succeeded.unwrap_or(0) > 0 {
        WorkloadState::Ready { ready_replicas: 0 }
    } else if status.failed.unwrap_or(0) > limit {
        WorkloadState::Failed(format!("Job {} failed", name))
    } else {
        WorkloadState::Progressing(format!("Job {} still running", name))
    }
}

/// Map Deployment status onto [`WorkloadState`]
#[must_use]
pub fn deployment_state(deployment: &Deployment) -> WorkloadState {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let wanted = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or(0);

    let deadline_exceeded = status.conditions.as_ref().is_some_and(|conditions| {
        conditions.iter().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        })
    });
    if deadline_exceeded {
        return WorkloadState::Failed(format!(
            "Deployment {} exceeded its progress deadline",
            name
        ));
    }

    let ready_replicas = status.ready_replicas.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) >= generation && ready_replicas == wanted {
        WorkloadState::Ready { ready_replicas }
    } else {
        WorkloadState::Progressing(format!(
            "Deployment {} has {}/{} replicas ready",
            name, ready_replicas, wanted
        ))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self
            .dynamic(target.kind, &target.namespace)
            .get_opt(&target.name)
            .await?)
    }

    async fn apply(&self, target: &ObjectRef, body: Value) -> Result<DynamicObject, ClusterError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.dynamic(target.kind, &target.namespace)
            .patch(&target.name, &params, &Patch::Apply(&body))
            .await
            .map_err(|e| classify(e, target))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(self
            .dynamic(kind, namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn add_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError> {
        self.write_finalizers(target, token, true).await
    }

    async fn remove_finalizer(
        &self,
        target: &ObjectRef,
        token: &str,
    ) -> Result<FinalizerUpdate, ClusterError> {
        self.write_finalizers(target, token, false).await
    }

    async fn patch_status(
        &self,
        target: &ObjectRef,
        resource_version: Option<&str>,
        patch: Value,
    ) -> Result<(), ClusterError> {
        let mut body = json!({ "status": patch });
        if let Some(rv) = resource_version {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        self.dynamic(target.kind, &target.namespace)
            .patch_status(&target.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| classify(e, target))?;
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(secret))
            .await?;
        Ok(())
    }

    async fn apply_workload(
        &self,
        namespace: &str,
        workload: &Workload,
    ) -> Result<WorkloadState, ClusterError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let name = workload.name().to_string();
        match workload {
            Workload::Job(job) => self.apply_job(namespace, job).await,
            Workload::Deployment(deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let applied = api.patch(&name, &params, &Patch::Apply(deployment)).await?;
                Ok(deployment_state(&applied))
            }
            Workload::CronJob(cron) => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(cron)).await?;
                Ok(WorkloadState::Ready { ready_replicas: 0 })
            }
            Workload::Service(service) => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(service)).await?;
                Ok(WorkloadState::Ready { ready_replicas: 0 })
            }
        }
    }
}
