//! # KeystoneService Reconciler
//!
//! Registers one OpenStack service with the keystone of its namespace: the
//! catalog entry and a service user holding the service roles. Talks to
//! keystone through an admin session opened with the KeystoneAPI's own
//! credentials, and marks that KeystoneAPI so it is not torn down while the
//! registration still exists.
//!
//! A KeystoneService that recorded a `serviceID` is only released once
//! keystone dropped the registration, or once its KeystoneAPI is itself
//! being deleted. While the KeystoneAPI is missing, deletion waits for it.

pub mod sync;

pub use sync::Synchronizer;

use crate::cluster::secrets::{resolve_field, SecretLookup};
use crate::cluster::{Cluster, ObjectRef, ResourceKind};
use crate::constants::{DEFAULT_DOMAIN, KEYSTONE_SERVICE_FINALIZER};
use crate::controller::conditions::ConditionSet;
use crate::controller::finalizers;
use crate::controller::scope;
use crate::controller::types::{Context, ReconcilerError};
use crate::crd::{
    ConditionReason, ConditionType, Endpoint, KeystoneAPI, KeystoneService,
    KeystoneServiceStatus, Severity,
};
use crate::identity::{AdminCredentials, IdentityBackend, ServiceRequest};
use crate::observability;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

const SEEDED_REQUEUE: Duration = Duration::from_secs(1);

pub const TRACKED_CONDITIONS: [ConditionType; 4] = [
    ConditionType::KeystoneApiReady,
    ConditionType::AdminServiceClientReady,
    ConditionType::KeystoneServiceOsServiceReady,
    ConditionType::KeystoneServiceOsUserReady,
];

struct ServicePass {
    target: ObjectRef,
    namespace: String,
    /// Marker this KeystoneService places on the KeystoneAPI
    token: String,
    conditions: ConditionSet,
    status: KeystoneServiceStatus,
    original: Value,
    generation: Option<i64>,
    resource_version: Option<String>,
    released: bool,
    delay: Duration,
}

impl ServicePass {
    fn new(service: &KeystoneService, delay: Duration) -> Self {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let status = service.status.clone().unwrap_or_default();
        let original = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        Self {
            target: ObjectRef::new(ResourceKind::KeystoneService, &namespace, &name),
            token: finalizers::owner_token("KeystoneService", &name),
            conditions: ConditionSet::init(
                &TRACKED_CONDITIONS,
                &status.conditions,
                service.metadata.generation,
            ),
            namespace,
            status,
            original,
            generation: service.metadata.generation,
            resource_version: service.metadata.resource_version.clone(),
            released: false,
            delay,
        }
    }

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

    fn requeue_on(
        &mut self,
        type_: ConditionType,
        reason: ConditionReason,
        severity: Severity,
        message: impl Into<String>,
    ) -> Action {
        self.conditions.mark_false(type_, reason, severity, message);
        observability::metrics::increment_requeues_total("not-ready");
        Action::requeue(self.delay)
    }
}

/// The KeystoneAPI of a namespace; there is at most one
async fn find_keystone_api(
    cluster: &dyn Cluster,
    namespace: &str,
) -> Result<Option<KeystoneAPI>, ReconcilerError> {
    let mut found = cluster.list(ResourceKind::KeystoneApi, namespace).await?;
    if found.len() > 1 {
        return Err(ReconcilerError::InvalidSpec(format!(
            "more than one KeystoneAPI in namespace {}",
            namespace
        )));
    }
    match found.pop() {
        Some(obj) => {
            let value = serde_json::to_value(obj).map_err(crate::cluster::ClusterError::from)?;
            let api = serde_json::from_value(value).map_err(crate::cluster::ClusterError::from)?;
            Ok(Some(api))
        }
        None => Ok(None),
    }
}

fn api_object(api: &KeystoneAPI) -> ObjectRef {
    ObjectRef::new(
        ResourceKind::KeystoneApi,
        &api.namespace().unwrap_or_default(),
        &api.name_any(),
    )
}

/// Open an admin session against the KeystoneAPI's internal endpoint
///
/// Returns `None`, with `AdminServiceClientReady` explaining why, while the
/// endpoint or the admin password is not available yet.
async fn admin_session(
    ctx: &Context,
    api: &KeystoneAPI,
    pass: &mut ServicePass,
) -> Result<Option<Arc<dyn IdentityBackend>>, ReconcilerError> {
    let Some(auth_url) = api.endpoint_url(Endpoint::Internal).map(str::to_string) else {
        pass.conditions.mark_false(
            ConditionType::AdminServiceClientReady,
            ConditionReason::Requested,
            Severity::Info,
            "KeystoneAPI has no internal endpoint yet",
        );
        return Ok(None);
    };
    let namespace = api.namespace().unwrap_or_default();
    let selector = &api.spec.password_selectors.admin;
    let password = match resolve_field(
        ctx.cluster.as_ref(),
        &namespace,
        &api.spec.secret,
        selector,
    )
    .await?
    {
        SecretLookup::Found(password) => password,
        _ => {
            pass.conditions.mark_false(
                ConditionType::AdminServiceClientReady,
                ConditionReason::NotFound,
                Severity::Warning,
                format!("Admin password {} not found in secret {}", selector, api.spec.secret),
            );
            return Ok(None);
        }
    };

    let credentials = AdminCredentials {
        auth_url,
        username: api.spec.admin_user.clone(),
        password,
        project: api.spec.admin_project.clone(),
        domain: DEFAULT_DOMAIN.to_string(),
        region: api.spec.region.clone(),
    };
    match ctx.identity.connect(&credentials).await {
        Ok(backend) => {
            pass.conditions.mark_true(
                ConditionType::AdminServiceClientReady,
                "Admin client ready",
            );
            Ok(Some(backend))
        }
        Err(e) => {
            pass.conditions.mark_false(
                ConditionType::AdminServiceClientReady,
                ConditionReason::Error,
                Severity::Error,
                e.to_string(),
            );
            Err(e.into())
        }
    }
}

/// Reconcile one KeystoneService
pub async fn reconcile(
    service: Arc<KeystoneService>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let span = tracing::info_span!(
        "reconcile",
        resource.name = %service.name_any(),
        resource.namespace = %service.namespace().unwrap_or_default(),
        resource.kind = "KeystoneService"
    );
    reconcile_scoped(service, ctx).instrument(span).await
}

async fn reconcile_scoped(
    service: Arc<KeystoneService>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    observability::metrics::increment_reconciliations();

    let mut pass = ServicePass::new(&service, ctx.config.not_ready_requeue_duration());
    let resource = pass.target.to_string();
    let outcome = scope::guarded(&resource, run(&service, &ctx, &mut pass)).await;
    let finished = pass.finish(ctx.cluster.as_ref()).await;
    observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

    match (outcome, finished) {
        (Ok(action), Ok(())) => {
            ctx.reset_backoff("KeystoneService", &pass.namespace, &pass.target.name);
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
    service: &KeystoneService,
    ctx: &Context,
    pass: &mut ServicePass,
) -> Result<Action, ReconcilerError> {
    let cluster = ctx.cluster.as_ref();
    if service.is_deleting() {
        let api = find_keystone_api(cluster, &pass.namespace).await?;
        return reconcile_delete(service, ctx, pass, api).await;
    }

    if pass.conditions.is_fresh() {
        info!("🆕 Initialising conditions of {}", pass.target);
        return Ok(Action::requeue(SEEDED_REQUEUE));
    }

    let update = cluster
        .add_finalizer(&pass.target, KEYSTONE_SERVICE_FINALIZER)
        .await?;
    if update.changed {
        pass.resource_version = update.resource_version;
    }

    let Some(api) = find_keystone_api(cluster, &pass.namespace).await? else {
        return Ok(pass.requeue_on(
            ConditionType::KeystoneApiReady,
            ConditionReason::NotFound,
            Severity::Warning,
            "KeystoneAPI not found",
        ));
    };
    if !api.is_ready() {
        return Ok(pass.requeue_on(
            ConditionType::KeystoneApiReady,
            ConditionReason::Requested,
            Severity::Info,
            "KeystoneAPI not yet ready",
        ));
    }
    finalizers::ensure(cluster, &pass.token, &api_object(&api)).await?;
    pass.conditions
        .mark_true(ConditionType::KeystoneApiReady, "KeystoneAPI ready");

    let Some(backend) = admin_session(ctx, &api, pass).await? else {
        observability::metrics::increment_requeues_total("not-ready");
        return Ok(Action::requeue(pass.delay));
    };
    let synchronizer = Synchronizer::new(backend.as_ref());

    info!("🔄 Registering service {} in keystone", service.spec.service_name);
    let desired = ServiceRequest {
        service_type: service.spec.service_type.clone(),
        name: service.spec.service_name.clone(),
        description: service.spec.service_description.clone(),
        enabled: service.spec.enabled,
    };
    match synchronizer.reconcile_service(&desired).await {
        Ok(entity) => {
            pass.status.service_id = Some(entity.id);
            pass.conditions.mark_true(
                ConditionType::KeystoneServiceOsServiceReady,
                "Service registered",
            );
        }
        Err(e) => {
            pass.conditions.mark_false(
                ConditionType::KeystoneServiceOsServiceReady,
                ConditionReason::Error,
                Severity::Error,
                e.to_string(),
            );
            return Err(e.into());
        }
    }

    let password = match resolve_field(
        cluster,
        &pass.namespace,
        &service.spec.secret,
        &service.spec.password_selector,
    )
    .await?
    {
        SecretLookup::Found(password) => password,
        _ => {
            return Ok(pass.requeue_on(
                ConditionType::KeystoneServiceOsUserReady,
                ConditionReason::NotFound,
                Severity::Warning,
                format!(
                    "Password {} not found in secret {}",
                    service.spec.password_selector, service.spec.secret
                ),
            ))
        }
    };
    if let Err(e) = synchronizer
        .reconcile_user(&service.spec.service_user, password)
        .await
    {
        pass.conditions.mark_false(
            ConditionType::KeystoneServiceOsUserReady,
            ConditionReason::Error,
            Severity::Error,
            e.to_string(),
        );
        return Err(e.into());
    }
    pass.conditions.mark_true(
        ConditionType::KeystoneServiceOsUserReady,
        "Service user ready",
    );

    info!("✅ KeystoneService {} reconciled", pass.target);
    Ok(Action::await_change())
}

async fn reconcile_delete(
    service: &KeystoneService,
    ctx: &Context,
    pass: &mut ServicePass,
    api: Option<KeystoneAPI>,
) -> Result<Action, ReconcilerError> {
    info!("🗑️  Deleting KeystoneService {}", pass.target);
    let cluster = ctx.cluster.as_ref();

    match (api.as_ref(), service.service_id()) {
        (Some(api), Some(service_id)) if !api.is_deleting() => {
            let Some(backend) = admin_session(ctx, api, pass).await? else {
                return Ok(Action::requeue(pass.delay));
            };
            let synchronizer = Synchronizer::new(backend.as_ref());
            synchronizer.delete_user(&service.spec.service_user).await?;
            synchronizer.delete_service(service_id).await?;
            pass.status.service_id = None;
        }
        (Some(_), Some(_)) => {
            info!(
                "KeystoneAPI is being deleted, releasing {} without touching keystone",
                pass.target
            );
        }
        (None, Some(service_id)) => {
            info!(
                "KeystoneAPI not found, keeping {} until service {} can be removed",
                pass.target, service_id
            );
            return Ok(pass.requeue_on(
                ConditionType::KeystoneApiReady,
                ConditionReason::NotFound,
                Severity::Warning,
                "KeystoneAPI not found",
            ));
        }
        (_, None) => {}
    }

    if let Some(api) = api.as_ref() {
        finalizers::release(cluster, &pass.token, &api_object(api)).await?;
    }
    cluster
        .remove_finalizer(&pass.target, KEYSTONE_SERVICE_FINALIZER)
        .await?;
    pass.released = true;
    ctx.forget_backoff("KeystoneService", &pass.namespace, &pass.target.name);
    Ok(Action::await_change())
}
