//! # Watch Loop
//!
//! Runs the KeystoneAPI and KeystoneService controllers side by side until a
//! shutdown signal arrives.
//!
//! KeystoneAPI reconciliations are triggered by the object itself, by the
//! workloads and dependents it owns, and by the secrets and foreign objects
//! it only reads, so a changed input reaches the deployment without waiting
//! for the next key rotation. KeystoneService objects are additionally
//! requeued whenever a KeystoneAPI in their namespace changes, since their
//! readiness hangs off the API being ready.

use crate::cluster::ResourceKind;
use crate::controller::keystone_api;
use crate::controller::keystone_service;
use crate::controller::types::Context;
use crate::crd::{KeystoneAPI, KeystoneService};
use crate::runtime::error_policy::handle_reconciliation_error;
use crate::server::ServerState;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::reflector::{ObjectRef as WatchRef, Store};
use kube_runtime::{watcher, Controller};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn scoped<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

fn scoped_dynamic(client: &Client, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
    if namespace.is_empty() {
        Api::all_with(client.clone(), resource)
    } else {
        Api::namespaced_with(client.clone(), namespace, resource)
    }
}

/// KeystoneAPIs in the namespace of `obj` for which `reads` holds
fn keystone_apis_reading<K: Resource>(
    apis: &Store<KeystoneAPI>,
    obj: &K,
    reads: impl Fn(&KeystoneAPI, &str) -> bool,
) -> Vec<WatchRef<KeystoneAPI>> {
    let namespace = obj.namespace();
    let name = obj.name_any();
    apis.state()
        .into_iter()
        .filter(|api| api.namespace() == namespace && reads(api, &name))
        .map(|api| WatchRef::from_obj(api.as_ref()))
        .collect()
}

/// Run both controllers until shutdown
pub async fn run_watch_loop(
    client: Client,
    ctx: Arc<Context>,
    server_state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let namespace = ctx.config.watch_namespace.clone();
    if namespace.is_empty() {
        info!("Watching KeystoneAPI and KeystoneService in all namespaces");
    } else {
        info!("Watching KeystoneAPI and KeystoneService in namespace {}", namespace);
    }

    let wc = watcher::Config::default().any_semantic();
    let database = ResourceKind::MariaDbDatabase.api_resource();
    let transport = ResourceKind::TransportUrl.api_resource();

    let api_controller = Controller::new(scoped::<KeystoneAPI>(&client, &namespace), wc.clone());
    let apis = api_controller.store();
    let mut api_controller = api_controller
        .owns(scoped::<Deployment>(&client, &namespace), wc.clone())
        .owns(scoped::<Job>(&client, &namespace), wc.clone())
        .owns(scoped::<CronJob>(&client, &namespace), wc.clone())
        .owns(scoped::<Service>(&client, &namespace), wc.clone())
        .owns(scoped::<Secret>(&client, &namespace), wc.clone())
        .owns_with(
            scoped_dynamic(&client, &namespace, &database),
            database.clone(),
            wc.clone(),
        )
        .owns_with(
            scoped_dynamic(&client, &namespace, &transport),
            transport.clone(),
            wc.clone(),
        );

    let secret_readers = apis.clone();
    api_controller = api_controller.watches(
        scoped::<Secret>(&client, &namespace),
        wc.clone(),
        move |secret: Secret| {
            keystone_apis_reading(&secret_readers, &secret, |api, name| {
                keystone_api::referenced_secrets(api).contains(name)
            })
        },
    );
    for kind in [
        ResourceKind::MariaDbAccount,
        ResourceKind::Memcached,
        ResourceKind::Topology,
        ResourceKind::NetworkAttachmentDefinition,
    ] {
        let resource = kind.api_resource();
        let readers = apis.clone();
        api_controller = api_controller.watches_with(
            scoped_dynamic(&client, &namespace, &resource),
            resource.clone(),
            wc.clone(),
            move |obj: DynamicObject| {
                keystone_apis_reading(&readers, &obj, |api, name| {
                    keystone_api::references(api, kind, name)
                })
            },
        );
    }

    let api_controller = api_controller
        .shutdown_on_signal()
        .run(
            keystone_api::reconcile,
            |obj, error, ctx| handle_reconciliation_error(obj, error, ctx),
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("KeystoneAPI {} reconciled", obj.name),
                Err(e) => warn!("KeystoneAPI controller event error: {}", e),
            }
        });

    let service_controller =
        Controller::new(scoped::<KeystoneService>(&client, &namespace), wc.clone());
    let services = service_controller.store();
    let service_controller = service_controller
        .watches(
            scoped::<KeystoneAPI>(&client, &namespace),
            wc,
            move |api: KeystoneAPI| {
                let api_namespace = api.namespace();
                services
                    .state()
                    .into_iter()
                    .filter(|service| service.namespace() == api_namespace)
                    .map(|service| WatchRef::from_obj(service.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(
            keystone_service::reconcile,
            |obj, error, ctx| handle_reconciliation_error(obj, error, ctx),
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!("KeystoneService {} reconciled", obj.name),
                Err(e) => warn!("KeystoneService controller event error: {}", e),
            }
        });

    server_state.is_ready.store(true, Ordering::Relaxed);
    info!("Controllers started");

    futures::future::join(api_controller, service_controller).await;

    server_state.is_ready.store(false, Ordering::Relaxed);
    info!("Controllers stopped gracefully");
    Ok(())
}
