//! # Error Policy
//!
//! Decides when a failed reconciliation runs again. Conflicts retry almost
//! immediately since the next pass simply reads the newer object; every
//! other error backs off per object along a Fibonacci sequence, reset by the
//! next successful pass.

use crate::constants::CONFLICT_REQUEUE_SECS;
use crate::controller::backoff::BackoffState;
use crate::controller::types::{Context, ReconcilerError};
use crate::observability;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue for `obj` after `error`
pub fn handle_reconciliation_error<K>(
    obj: Arc<K>,
    error: &ReconcilerError,
    ctx: Arc<Context>,
) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&()).to_string();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    let error_span = tracing::error_span!(
        "controller.reconciliation_error",
        resource.kind = %kind,
        resource.name = %name,
        resource.namespace = %namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    observability::metrics::increment_reconciliation_errors();

    if error.is_conflict() {
        info!("⚡ {} {}/{} changed underneath, retrying", kind, namespace, name);
        observability::metrics::increment_requeues_total("conflict");
        return Action::requeue(Duration::from_secs(CONFLICT_REQUEUE_SECS));
    }

    error!("Reconciliation error for {} {}/{}: {:?}", kind, namespace, name, error);
    let key = Context::backoff_key(&kind, &namespace, &name);
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key).or_insert_with(|| {
                BackoffState::new(ctx.config.backoff_min_minutes, ctx.config.backoff_max_minutes)
            });
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (ctx.config.reconciliation_error_requeue_secs, 0)
        }
    };

    info!(
        "🔄 Retrying with Fibonacci backoff: {}s (error count: {})",
        backoff_seconds, error_count
    );
    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}
