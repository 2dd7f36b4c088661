//! # KeystoneAPI Reconciler
//!
//! One invocation loads the object, seeds or carries over its conditions,
//! then either runs the deletion path or walks the stages in
//! [`Stage::ORDER`] until one of them asks for a requeue.
//!
//! Status is written exactly once per invocation in [`ApiPass::finish`],
//! whether the stages returned normally, stopped early or failed. A panic
//! skips the write and propagates.

mod delete;
pub mod resources;
mod stages;

use crate::cluster::{Cluster, ObjectRef, ResourceKind};
use crate::constants::KEYSTONE_API_FINALIZER;
use crate::controller::conditions::ConditionSet;
use crate::controller::finalizers::owner_token;
use crate::controller::gate::{self, Stage, StageOutcome};
use crate::controller::scope;
use crate::controller::types::{Context, ReconcilerError};
use crate::crd::{ConditionType, KeystoneAPI, KeystoneAPIStatus, TopologyRef};
use crate::observability;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use resources::RenderInputs;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

/// Delay before the first real pass after seeding conditions
const SEEDED_REQUEUE: Duration = Duration::from_secs(1);

/// Conditions a KeystoneAPI reports, given its current spec
///
/// TLS input and topology are only tracked while configured, so dropping
/// either from the spec also drops its condition.
#[must_use]
pub fn tracked_conditions(api: &KeystoneAPI) -> Vec<ConditionType> {
    Stage::ORDER
        .iter()
        .filter(|stage| match stage {
            Stage::TlsInput => api.tls_enabled(),
            Stage::Topology => api.spec.topology_ref.is_some(),
            _ => true,
        })
        .map(|stage| stage.condition())
        .collect()
}

/// Address of the Topology a reference points at
#[must_use]
pub fn topology_object(reference: &TopologyRef, default_namespace: &str) -> ObjectRef {
    ObjectRef::new(
        ResourceKind::Topology,
        reference.namespace.as_deref().unwrap_or(default_namespace),
        &reference.name,
    )
}

/// Secrets a KeystoneAPI reads without owning them
#[must_use]
pub fn referenced_secrets(api: &KeystoneAPI) -> BTreeSet<String> {
    let spec = &api.spec;
    let mut secrets = BTreeSet::from([
        spec.secret.clone(),
        resources::account_secret_name(&spec.database_account),
    ]);
    if let Some(tls) = spec.tls.as_ref() {
        secrets.extend(tls.ca_bundle_secret_name.clone());
        secrets.extend(tls.api.values().map(|s| s.secret_name.clone()));
    }
    secrets.extend(
        spec.httpd_customization
            .as_ref()
            .and_then(|c| c.custom_config_secret.clone()),
    );
    secrets.extend(spec.federated_realm_config.clone());
    secrets.extend(spec.extra_mounts.iter().filter_map(|m| m.secret.clone()));
    if let Some(status) = api.status.as_ref() {
        secrets.extend(status.transport_url_secret.clone());
    }
    secrets.retain(|name| !name.is_empty());
    secrets
}

/// Whether `api` reads the `kind` object called `name` in its namespace
///
/// Covers the dependents it consumes but does not own. The previous
/// Topology and MariaDBAccount count until they are released.
#[must_use]
pub fn references(api: &KeystoneAPI, kind: ResourceKind, name: &str) -> bool {
    let spec = &api.spec;
    let status = api.status.as_ref();
    match kind {
        ResourceKind::Memcached => spec.memcached_instance == name,
        ResourceKind::Topology => spec
            .topology_ref
            .iter()
            .chain(status.and_then(|s| s.last_applied_topology.as_ref()))
            .any(|reference| reference.name == name),
        ResourceKind::MariaDbAccount => {
            spec.database_account == name
                || status
                    .and_then(|s| s.last_applied_database_account.as_deref())
                    .is_some_and(|previous| previous == name)
        }
        ResourceKind::NetworkAttachmentDefinition => spec
            .network_attachments
            .iter()
            .any(|attachment| attachment.rsplit('/').next() == Some(name)),
        _ => false,
    }
}

/// Working state of one invocation
pub(crate) struct ApiPass {
    pub target: ObjectRef,
    pub namespace: String,
    pub name: String,
    /// Marker placed on every dependent this KeystoneAPI consumes
    pub token: String,
    pub conditions: ConditionSet,
    pub status: KeystoneAPIStatus,
    original: Value,
    generation: Option<i64>,
    pub resource_version: Option<String>,
    /// Own finalizer is gone; the object may no longer exist
    pub released: bool,
    pub delay: Duration,
    pub inputs: RenderInputs,
    /// Digest of the admin password
    pub input_hash: String,
    /// Digest of the rendered configuration files
    pub service_config_hash: String,
    pub next_rotation: Option<DateTime<Utc>>,
}

impl ApiPass {
    fn new(api: &KeystoneAPI, delay: Duration) -> Self {
        let namespace = api.namespace().unwrap_or_default();
        let name = api.name_any();
        let status = api.status.clone().unwrap_or_default();
        let original = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        let conditions =
            ConditionSet::init(&tracked_conditions(api), &status.conditions, api.metadata.generation);
        Self {
            target: ObjectRef::new(ResourceKind::KeystoneApi, &namespace, &name),
            token: owner_token("KeystoneAPI", &name),
            namespace,
            name,
            conditions,
            status,
            original,
            generation: api.metadata.generation,
            resource_version: api.metadata.resource_version.clone(),
            released: false,
            delay,
            inputs: RenderInputs::default(),
            input_hash: String::new(),
            service_config_hash: String::new(),
            next_rotation: None,
        }
    }

    /// Fold conditions into Ready and write whatever changed
    async fn finish(&mut self, cluster: &dyn Cluster) -> Result<(), ReconcilerError> {
        if self.released {
            return Ok(());
        }
        self.conditions.recompute_ready();
        self.status.conditions = self.conditions.to_vec();
        self.status.observed_generation = self.generation;

        scope::write_status(
            cluster,
            &self.target,
            self.resource_version.as_deref(),
            &self.original,
            &self.status,
        )
        .await
    }

    fn until_next_rotation(&self, now: DateTime<Utc>) -> Duration {
        self.next_rotation
            .and_then(|next| (next - now).to_std().ok())
            .map_or(SEEDED_REQUEUE, |left| left.max(SEEDED_REQUEUE))
    }
}

/// Reconcile one KeystoneAPI
pub async fn reconcile(
    api: Arc<KeystoneAPI>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let span = tracing::info_span!(
        "reconcile",
        resource.name = %api.name_any(),
        resource.namespace = %api.namespace().unwrap_or_default(),
        resource.kind = "KeystoneAPI"
    );
    reconcile_scoped(api, ctx).instrument(span).await
}

async fn reconcile_scoped(
    api: Arc<KeystoneAPI>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    observability::metrics::increment_reconciliations();

    let mut pass = ApiPass::new(&api, ctx.config.not_ready_requeue_duration());
    let resource = pass.target.to_string();
    let outcome = scope::guarded(&resource, run(&api, &ctx, &mut pass)).await;
    let finished = pass.finish(ctx.cluster.as_ref()).await;
    observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

    match (outcome, finished) {
        (Ok(action), Ok(())) => {
            if ctx.reset_backoff("KeystoneAPI", &pass.namespace, &pass.name) {
                info!("✅ {} recovered, backoff reset", resource);
            }
            Ok(action)
        }
        (Ok(_), Err(patch_error)) => Err(patch_error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(patch_error)) => {
            warn!("Failed to patch status of {}: {}", resource, patch_error);
            Err(error)
        }
    }
}

async fn run(
    api: &KeystoneAPI,
    ctx: &Context,
    pass: &mut ApiPass,
) -> Result<Action, ReconcilerError> {
    if api.is_deleting() {
        return delete::reconcile_delete(api, ctx, pass).await;
    }

    if pass.conditions.is_fresh() {
        info!("🆕 Initialising conditions of {}", pass.target);
        return Ok(Action::requeue(SEEDED_REQUEUE));
    }

    let update = ctx
        .cluster
        .add_finalizer(&pass.target, KEYSTONE_API_FINALIZER)
        .await?;
    if update.changed {
        pass.resource_version = update.resource_version;
    }

    info!("🔄 Reconciling KeystoneAPI {}", pass.target);
    for stage in Stage::ORDER {
        let result = stages::run_stage(stage, api, ctx, pass).await;
        match gate::settle(&mut pass.conditions, stage, result)? {
            StageOutcome::Continue => {}
            StageOutcome::Requeue(delay) => {
                observability::metrics::increment_requeues_total("not-ready");
                return Ok(Action::requeue(delay));
            }
        }
    }

    info!("✅ KeystoneAPI {} reconciled", pass.target);
    Ok(Action::requeue(pass.until_next_rotation(Utc::now())))
}
