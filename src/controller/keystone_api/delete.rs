//! # KeystoneAPI Deletion
//!
//! Releases the markers this KeystoneAPI placed on the dependents it
//! consumed, then drops its own finalizer. Dependents already on their way
//! out, or already gone, need nothing beyond the release, so deletion never
//! waits on them.

use super::{topology_object, ApiPass};
use crate::cluster::{ObjectRef, ResourceKind};
use crate::constants::KEYSTONE_API_FINALIZER;
use crate::controller::finalizers;
use crate::controller::types::{Context, ReconcilerError};
use crate::crd::KeystoneAPI;
use kube_runtime::controller::Action;
use tracing::info;

/// Every dependent that may carry this KeystoneAPI's marker
fn dependents(api: &KeystoneAPI, pass: &ApiPass) -> Vec<ObjectRef> {
    let mut dependents = vec![
        ObjectRef::new(ResourceKind::MariaDbDatabase, &pass.namespace, &pass.name),
        ObjectRef::new(
            ResourceKind::MariaDbAccount,
            &pass.namespace,
            &api.spec.database_account,
        ),
    ];
    if let Some(previous) = pass.status.last_applied_database_account.as_deref() {
        dependents.push(ObjectRef::new(
            ResourceKind::MariaDbAccount,
            &pass.namespace,
            previous,
        ));
    }
    if let Some(reference) = api.spec.topology_ref.as_ref() {
        dependents.push(topology_object(reference, &pass.namespace));
    }
    if let Some(reference) = pass.status.last_applied_topology.as_ref() {
        dependents.push(topology_object(reference, &pass.namespace));
    }
    dependents.sort();
    dependents.dedup();
    dependents
}

pub(super) async fn reconcile_delete(
    api: &KeystoneAPI,
    ctx: &Context,
    pass: &mut ApiPass,
) -> Result<Action, ReconcilerError> {
    info!("🗑️  Deleting KeystoneAPI {}", pass.target);
    let cluster = ctx.cluster.as_ref();

    for dependent in dependents(api, pass) {
        finalizers::release(cluster, &pass.token, &dependent).await?;
    }

    cluster
        .remove_finalizer(&pass.target, KEYSTONE_API_FINALIZER)
        .await?;
    pass.released = true;
    ctx.forget_backoff("KeystoneAPI", &pass.namespace, &pass.name);
    info!("KeystoneAPI {} released its dependents", pass.target);
    Ok(Action::await_change())
}
