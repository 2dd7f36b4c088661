//! # KeystoneAPI Stages
//!
//! One function per [`Stage`]. Each reads or creates its prerequisites,
//! records what later stages need on the [`ApiPass`], and reports through
//! the gate helpers.

use super::resources::{self, DatabaseAccess, Placement};
use super::{topology_object, ApiPass};
use crate::cluster::secrets::{field_value, resolve_field, string_fields, SecretLookup};
use crate::cluster::{
    is_deleting, is_ready, Cluster, ObjectRef, ResourceKind, Workload, WorkloadState,
};
use crate::controller::fernet::{self, SystemKeySource};
use crate::controller::gate::{self, Stage, StageOutcome};
use crate::controller::types::{Context, ReconcilerError};
use crate::controller::{finalizers, hash};
use crate::crd::{Endpoint, KeystoneAPI, TopologyRef};
use chrono::Utc;
use kube::core::DynamicObject;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;
use zeroize::Zeroizing;

type StageResult = Result<StageOutcome, ReconcilerError>;

pub(super) async fn run_stage(
    stage: Stage,
    api: &KeystoneAPI,
    ctx: &Context,
    pass: &mut ApiPass,
) -> StageResult {
    let cluster = ctx.cluster.as_ref();
    match stage {
        Stage::Input => input(cluster, api, pass).await,
        Stage::TlsInput => tls_input(cluster, api, pass).await,
        Stage::Database => database(cluster, api, pass).await,
        Stage::MessageBus => message_bus(cluster, api, pass).await,
        Stage::Cache => cache(cluster, api, pass).await,
        Stage::ServiceConfig => service_config(cluster, api, pass).await,
        Stage::DbSync => db_sync(cluster, api, pass).await,
        Stage::CreateService => create_service(cluster, api, pass).await,
        Stage::Bootstrap => bootstrap(cluster, api, pass).await,
        Stage::Topology => topology(cluster, api, pass).await,
        Stage::NetworkAttachments => network_attachments(cluster, api, pass).await,
        Stage::Deployment => deployment(cluster, api, pass).await,
        Stage::CronJob => cron_job(cluster, api, pass).await,
    }
}

async fn input(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let selector = &api.spec.password_selectors.admin;
    match resolve_field(cluster, &pass.namespace, &api.spec.secret, selector).await? {
        SecretLookup::Found(password) => {
            pass.input_hash = hash::combine([password.as_str()]);
            Ok(gate::ready(&mut pass.conditions, Stage::Input, "Input data complete"))
        }
        SecretLookup::SecretMissing => Ok(gate::not_found(
            &mut pass.conditions,
            Stage::Input,
            pass.delay,
            format!("Input data resources missing: secret {}", api.spec.secret),
        )),
        SecretLookup::FieldMissing => Ok(gate::not_found(
            &mut pass.conditions,
            Stage::Input,
            pass.delay,
            format!(
                "Input data resources missing: field {} in secret {}",
                selector, api.spec.secret
            ),
        )),
    }
}

async fn tls_input(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    if !api.tls_enabled() {
        pass.status.hash.remove("tls");
        pass.inputs.tls_hash = None;
        return Ok(StageOutcome::Continue);
    }

    let mut material = BTreeMap::new();
    let bundle = api
        .spec
        .tls
        .as_ref()
        .and_then(|tls| tls.ca_bundle_secret_name.clone());
    if let Some(bundle) = bundle {
        let Some(secret) = cluster.get_secret(&pass.namespace, &bundle).await? else {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::TlsInput,
                pass.delay,
                format!("CA bundle secret {} not found", bundle),
            ));
        };
        for (key, value) in string_fields(&secret) {
            material.insert(format!("{}/{}", bundle, key), value);
        }
    }

    for endpoint in Endpoint::ALL {
        let Some(secret_name) = api.tls_secret(endpoint) else {
            continue;
        };
        let Some(secret) = cluster.get_secret(&pass.namespace, secret_name).await? else {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::TlsInput,
                pass.delay,
                format!("Certificate secret {} not found", secret_name),
            ));
        };
        for field in ["tls.crt", "tls.key"] {
            let Some(value) = field_value(&secret, field) else {
                return Ok(gate::not_found(
                    &mut pass.conditions,
                    Stage::TlsInput,
                    pass.delay,
                    format!("Certificate secret {} has no {}", secret_name, field),
                ));
            };
            material.insert(format!("{}/{}", secret_name, field), value.as_str().to_string());
        }
    }

    let digest = hash::hash_map(&material);
    pass.status.hash.insert("tls".to_string(), digest.clone());
    pass.inputs.tls_hash = Some(digest);
    Ok(gate::ready(&mut pass.conditions, Stage::TlsInput, "TLS input ready"))
}

fn generate_password() -> Result<Zeroizing<String>, ReconcilerError> {
    let mut bytes = Zeroizing::new([0u8; 16]);
    SystemRandom::new()
        .fill(&mut bytes[..])
        .map_err(|e| anyhow::anyhow!("Failed to generate database password: {}", e))?;
    let mut password = Zeroizing::new(String::with_capacity(32));
    for byte in bytes.iter() {
        password.push_str(&format!("{:02x}", byte));
    }
    Ok(password)
}

fn spec_str(obj: &DynamicObject, pointer: &str) -> Option<String> {
    obj.data
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn database(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let database_ref = ObjectRef::new(ResourceKind::MariaDbDatabase, &pass.namespace, &pass.name);
    let database = cluster
        .apply(&database_ref, resources::database_body(api))
        .await?;
    finalizers::ensure(cluster, &pass.token, &database_ref).await?;

    let account_name = api.spec.database_account.clone();
    let account_ref = ObjectRef::new(ResourceKind::MariaDbAccount, &pass.namespace, &account_name);
    let account = match cluster.get(&account_ref).await? {
        Some(account) => account,
        None => {
            let secret_name = resources::account_secret_name(&account_name);
            if cluster
                .get_secret(&pass.namespace, &secret_name)
                .await?
                .is_none()
            {
                let password = generate_password()?;
                cluster
                    .apply_secret(&resources::account_secret(api, &password))
                    .await?;
            }
            info!("🗄️  Creating MariaDBAccount {}", account_ref);
            cluster
                .apply(&account_ref, resources::account_body(api))
                .await?
        }
    };
    finalizers::ensure(cluster, &pass.token, &account_ref).await?;

    if is_deleting(&database) || is_deleting(&account) {
        return Ok(gate::waiting(
            &mut pass.conditions,
            Stage::Database,
            pass.delay,
            "Database resources are being deleted",
        ));
    }
    if !is_ready(&database) {
        return Ok(gate::waiting(
            &mut pass.conditions,
            Stage::Database,
            pass.delay,
            format!("MariaDBDatabase {} not ready", database_ref.name),
        ));
    }
    if !is_ready(&account) {
        return Ok(gate::waiting(
            &mut pass.conditions,
            Stage::Database,
            pass.delay,
            format!("MariaDBAccount {} not ready", account_name),
        ));
    }

    // The new account is usable, the previous one can go.
    if let Some(previous) = pass.status.last_applied_database_account.clone() {
        if previous != account_name {
            let previous_ref =
                ObjectRef::new(ResourceKind::MariaDbAccount, &pass.namespace, &previous);
            finalizers::release(cluster, &pass.token, &previous_ref).await?;
            info!("Released MariaDBAccount {} after switching to {}", previous, account_name);
        }
    }
    pass.status.last_applied_database_account = Some(account_name.clone());

    let secret_name = spec_str(&account, "/spec/secret")
        .unwrap_or_else(|| resources::account_secret_name(&account_name));
    let username =
        spec_str(&account, "/spec/userName").unwrap_or_else(|| account_name.replace('-', "_"));
    let password = match resolve_field(cluster, &pass.namespace, &secret_name, "DatabasePassword")
        .await?
    {
        SecretLookup::Found(password) => password,
        _ => {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::Database,
                pass.delay,
                format!("Database password secret {} not found", secret_name),
            ))
        }
    };

    let hostname = format!("{}.{}.svc", api.spec.database_instance, pass.namespace);
    pass.status.database_hostname = Some(hostname.clone());
    pass.inputs.database = Some(DatabaseAccess {
        hostname,
        username,
        password,
    });
    Ok(gate::ready(&mut pass.conditions, Stage::Database, "DB create completed"))
}

async fn message_bus(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let transport_ref = ObjectRef::new(
        ResourceKind::TransportUrl,
        &pass.namespace,
        &resources::transport_url_name(api),
    );
    let transport = cluster
        .apply(&transport_ref, resources::transport_url_body(api))
        .await?;
    let secret_name = spec_str(&transport, "/status/secretName");
    let Some(secret_name) = secret_name.filter(|_| is_ready(&transport)) else {
        return Ok(gate::waiting(
            &mut pass.conditions,
            Stage::MessageBus,
            pass.delay,
            format!("TransportURL {} not ready", transport_ref.name),
        ));
    };

    match resolve_field(cluster, &pass.namespace, &secret_name, "transport_url").await? {
        SecretLookup::Found(url) => {
            pass.inputs.transport_url = Some(url);
            pass.status.transport_url_secret = Some(secret_name);
            Ok(gate::ready(
                &mut pass.conditions,
                Stage::MessageBus,
                "RabbitMQ transport URL ready",
            ))
        }
        _ => Ok(gate::not_found(
            &mut pass.conditions,
            Stage::MessageBus,
            pass.delay,
            format!("TransportURL secret {} not found", secret_name),
        )),
    }
}

async fn cache(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let memcached_ref = ObjectRef::new(
        ResourceKind::Memcached,
        &pass.namespace,
        &api.spec.memcached_instance,
    );
    let Some(memcached) = cluster.get(&memcached_ref).await? else {
        return Ok(gate::not_found(
            &mut pass.conditions,
            Stage::Cache,
            pass.delay,
            format!("Memcached {} not found", api.spec.memcached_instance),
        ));
    };
    if !is_ready(&memcached) {
        return Ok(gate::waiting(
            &mut pass.conditions,
            Stage::Cache,
            pass.delay,
            format!("Memcached {} not ready", api.spec.memcached_instance),
        ));
    }
    pass.inputs.memcached_servers = memcached
        .data
        .pointer("/status/serverList")
        .and_then(Value::as_array)
        .map(|servers| {
            servers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(gate::ready(&mut pass.conditions, Stage::Cache, "Memcached ready"))
}

async fn service_config(
    cluster: &dyn Cluster,
    api: &KeystoneAPI,
    pass: &mut ApiPass,
) -> StageResult {
    let outcome =
        fernet::ensure_fernet_keys(cluster, api, Utc::now(), &mut SystemKeySource::default())
            .await?;
    pass.next_rotation = outcome.next_rotation;
    pass.inputs.fernet_hash = Some(outcome.hash);

    pass.inputs.httpd_fragments.clear();
    let custom = api
        .spec
        .httpd_customization
        .as_ref()
        .and_then(|c| c.custom_config_secret.clone());
    if let Some(secret_name) = custom {
        let Some(secret) = cluster.get_secret(&pass.namespace, &secret_name).await? else {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::ServiceConfig,
                pass.delay,
                format!("httpd customization secret {} not found", secret_name),
            ));
        };
        pass.inputs.httpd_fragments = string_fields(&secret)
            .into_iter()
            .filter(|(key, _)| key.ends_with(".conf"))
            .map(|(key, value)| (format!("httpd_custom_{}", key), value))
            .collect();
    }

    pass.inputs.federation_hash = None;
    if let Some(secret_name) = api.spec.federated_realm_config.clone() {
        let Some(secret) = cluster.get_secret(&pass.namespace, &secret_name).await? else {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::ServiceConfig,
                pass.delay,
                format!("Federation realm secret {} not found", secret_name),
            ));
        };
        pass.inputs.federation_hash = Some(hash::hash_map(&string_fields(&secret)));
    }

    let files = resources::config_data(api, &pass.inputs);
    cluster
        .apply_secret(&resources::config_secret(api, &files))
        .await?;
    pass.service_config_hash = hash::hash_map(&files);

    let fernet_hash = pass.inputs.fernet_hash.clone().unwrap_or_default();
    let tls_hash = pass.inputs.tls_hash.clone().unwrap_or_default();
    let federation_hash = pass.inputs.federation_hash.clone().unwrap_or_default();
    let input_hash = hash::combine([
        pass.input_hash.as_str(),
        pass.service_config_hash.as_str(),
        fernet_hash.as_str(),
        tls_hash.as_str(),
        federation_hash.as_str(),
    ]);
    pass.status.hash.insert("input".to_string(), input_hash);
    Ok(gate::ready(
        &mut pass.conditions,
        Stage::ServiceConfig,
        "Service config create completed",
    ))
}

/// Turn a Job's state into the stage outcome, recording its hash once it succeeded
fn job_outcome(
    pass: &mut ApiPass,
    stage: Stage,
    hash_key: &str,
    hash: String,
    state: WorkloadState,
    done: &str,
) -> StageOutcome {
    match state {
        WorkloadState::Ready { .. } => {
            pass.status.hash.insert(hash_key.to_string(), hash);
            gate::ready(&mut pass.conditions, stage, done)
        }
        WorkloadState::Progressing(message) => {
            gate::waiting(&mut pass.conditions, stage, pass.delay, message)
        }
        WorkloadState::Failed(message) => {
            gate::failed(&mut pass.conditions, stage, pass.delay, message)
        }
    }
}

async fn db_sync(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let job_hash = hash::combine([
        pass.service_config_hash.as_str(),
        api.spec.container_image.as_str(),
    ]);
    let job = resources::db_sync_job(api, &job_hash);
    let state = cluster
        .apply_workload(&pass.namespace, &Workload::Job(job))
        .await?;
    Ok(job_outcome(
        pass,
        Stage::DbSync,
        "dbsync",
        job_hash,
        state,
        "DBsync completed",
    ))
}

async fn create_service(
    cluster: &dyn Cluster,
    api: &KeystoneAPI,
    pass: &mut ApiPass,
) -> StageResult {
    for endpoint in Endpoint::ALL {
        let service = resources::endpoint_service(api, endpoint);
        cluster
            .apply_workload(&pass.namespace, &Workload::Service(service))
            .await?;
        pass.status.api_endpoints.insert(
            endpoint.as_str().to_string(),
            resources::endpoint_url(api, endpoint),
        );
    }
    Ok(gate::ready(
        &mut pass.conditions,
        Stage::CreateService,
        "Create service completed",
    ))
}

async fn bootstrap(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let public = resources::endpoint_url(api, Endpoint::Public);
    let internal = resources::endpoint_url(api, Endpoint::Internal);
    let job_hash = hash::combine([
        pass.input_hash.as_str(),
        api.spec.container_image.as_str(),
        api.spec.admin_user.as_str(),
        api.spec.admin_project.as_str(),
        api.spec.region.as_str(),
        public.as_str(),
        internal.as_str(),
    ]);
    let job = resources::bootstrap_job(api, &job_hash);
    let state = cluster
        .apply_workload(&pass.namespace, &Workload::Job(job))
        .await?;
    Ok(job_outcome(
        pass,
        Stage::Bootstrap,
        "bootstrap",
        job_hash,
        state,
        "Bootstrap completed",
    ))
}

fn placement(topology: &DynamicObject) -> Result<Placement, serde_json::Error> {
    let spread = match topology.data.pointer("/spec/topologySpreadConstraints") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };
    let affinity = match topology.data.pointer("/spec/affinity") {
        Some(value) => Some(serde_json::from_value(value.clone())?),
        None => None,
    };
    Ok(Placement { spread, affinity })
}

async fn topology(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let previous = pass
        .status
        .last_applied_topology
        .as_ref()
        .map(|reference| topology_object(reference, &pass.namespace));

    let Some(reference) = api.spec.topology_ref.as_ref() else {
        finalizers::reassign(cluster, &pass.token, previous.as_ref(), None).await?;
        pass.status.last_applied_topology = None;
        pass.inputs.placement = None;
        return Ok(StageOutcome::Continue);
    };

    let current = topology_object(reference, &pass.namespace);
    let Some(topology) = cluster.get(&current).await? else {
        return Ok(gate::not_found(
            &mut pass.conditions,
            Stage::Topology,
            pass.delay,
            format!("Topology {} not found", current.name),
        ));
    };
    let placement = placement(&topology).map_err(|e| {
        ReconcilerError::InvalidSpec(format!("Topology {} is malformed: {}", current.name, e))
    })?;

    finalizers::reassign(cluster, &pass.token, previous.as_ref(), Some(&current)).await?;
    pass.status.last_applied_topology = Some(TopologyRef {
        name: current.name.clone(),
        namespace: Some(current.namespace.clone()),
    });
    pass.inputs.placement = Some(placement);
    Ok(gate::ready(
        &mut pass.conditions,
        Stage::Topology,
        "Topology config create completed",
    ))
}

async fn network_attachments(
    cluster: &dyn Cluster,
    api: &KeystoneAPI,
    pass: &mut ApiPass,
) -> StageResult {
    for name in &api.spec.network_attachments {
        let target = ObjectRef::new(
            ResourceKind::NetworkAttachmentDefinition,
            &pass.namespace,
            name,
        );
        if cluster.get(&target).await?.is_none() {
            return Ok(gate::not_found(
                &mut pass.conditions,
                Stage::NetworkAttachments,
                pass.delay,
                format!("NetworkAttachmentDefinition {} not found", name),
            ));
        }
    }
    pass.inputs.networks = api.spec.network_attachments.clone();
    Ok(gate::ready(
        &mut pass.conditions,
        Stage::NetworkAttachments,
        "NetworkAttachments completed",
    ))
}

async fn deployment(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let config_hash = pass.status.hash.get("input").cloned().unwrap_or_default();
    let deployment = resources::deployment(api, &pass.inputs, &config_hash);
    let state = cluster
        .apply_workload(&pass.namespace, &Workload::Deployment(deployment))
        .await?;
    match state {
        WorkloadState::Ready { ready_replicas } => {
            pass.status.ready_count = ready_replicas;
            Ok(gate::ready(
                &mut pass.conditions,
                Stage::Deployment,
                "Deployment completed",
            ))
        }
        // A rollout past its deadline is still reported as in progress.
        WorkloadState::Progressing(message) | WorkloadState::Failed(message) => Ok(gate::waiting(
            &mut pass.conditions,
            Stage::Deployment,
            pass.delay,
            message,
        )),
    }
}

async fn cron_job(cluster: &dyn Cluster, api: &KeystoneAPI, pass: &mut ApiPass) -> StageResult {
    let cron = resources::trust_flush_cron_job(api);
    match cluster
        .apply_workload(&pass.namespace, &Workload::CronJob(cron))
        .await?
    {
        WorkloadState::Ready { .. } => Ok(gate::ready(
            &mut pass.conditions,
            Stage::CronJob,
            "CronJob completed",
        )),
        WorkloadState::Progressing(message) | WorkloadState::Failed(message) => Ok(gate::waiting(
            &mut pass.conditions,
            Stage::CronJob,
            pass.delay,
            message,
        )),
    }
}
