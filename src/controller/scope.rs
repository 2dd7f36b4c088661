//! # Scoped Reconciliation
//!
//! Every reconciliation runs its stages through [`guarded`] and then
//! finishes by writing status. Ordinary returns and errors reach the finish
//! step; a panic is logged and re-raised instead, so a crashed pass never
//! writes a status that looks like progress.

use crate::cluster::{merge_patch, Cluster, ClusterError, ObjectRef};
use crate::controller::types::ReconcilerError;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// Run `fut`, re-raising any panic after logging it against `resource`
pub async fn guarded<F, T>(resource: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => value,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(
                "💥 Reconciliation of {} panicked, status left untouched: {}",
                resource, message
            );
            crate::observability::metrics::increment_reconciliation_errors();
            std::panic::resume_unwind(panic)
        }
    }
}

/// Write the difference between `original` and `status` to the status subresource
///
/// Nothing is written when the pass changed nothing. With `resource_version`
/// set, a concurrent writer turns the patch into a conflict.
pub async fn write_status<S: Serialize>(
    cluster: &dyn Cluster,
    target: &ObjectRef,
    resource_version: Option<&str>,
    original: &Value,
    status: &S,
) -> Result<(), ReconcilerError> {
    let desired = serde_json::to_value(status).map_err(ClusterError::from)?;
    let patch = merge_patch(original, &desired);
    if patch.as_object().is_some_and(serde_json::Map::is_empty) {
        debug!("Status of {} unchanged", target);
        return Ok(());
    }
    cluster.patch_status(target, resource_version, patch).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_passes_values_through() {
        assert_eq!(guarded("KeystoneAPI/ns/a", async { 7 }).await, 7);
    }

    #[tokio::test]
    async fn test_guarded_reraises_panics() {
        let handle = tokio::spawn(async {
            guarded("KeystoneAPI/ns/a", async {
                panic!("boom");
            })
            .await
        });
        let err = handle.await.unwrap_err();
        assert!(err.is_panic());
    }
}
