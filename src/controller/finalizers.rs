//! # Finalizer Coordinator
//!
//! Cross-resource deletion markers. A consumer records
//! `openstack.org/{ownerKind}-{ownerName}` on each dependent it uses, so the
//! dependent cannot disappear underneath it, and removes the marker once it
//! is deleted or stops referencing the dependent.
//!
//! Both operations are set operations on the dependent's finalizer list:
//! repeating them is harmless, concurrent owners never interfere, and a
//! dependent that is already gone counts as released.

use crate::cluster::{Cluster, ClusterError, FinalizerUpdate, ObjectRef};
use tracing::debug;

/// Marker `owner_kind`/`owner_name` places on its dependents
#[must_use]
pub fn owner_token(owner_kind: &str, owner_name: &str) -> String {
    format!("openstack.org/{}-{}", owner_kind.to_lowercase(), owner_name)
}

/// Add `token` to `dependent` if absent
pub async fn ensure(
    cluster: &dyn Cluster,
    token: &str,
    dependent: &ObjectRef,
) -> Result<FinalizerUpdate, ClusterError> {
    let update = cluster.add_finalizer(dependent, token).await?;
    if update.changed {
        debug!("Registered {} on {}", token, dependent);
    }
    Ok(update)
}

/// Remove `token` from `dependent` if present
pub async fn release(
    cluster: &dyn Cluster,
    token: &str,
    dependent: &ObjectRef,
) -> Result<FinalizerUpdate, ClusterError> {
    let update = cluster.remove_finalizer(dependent, token).await?;
    if update.changed {
        debug!("Released {} from {}", token, dependent);
    }
    Ok(update)
}

/// Move `token` from the previously referenced dependent to the current one
///
/// The new target is marked before the old one is released, so at no point
/// is neither protected. Passing `None` for `current` releases `previous`.
pub async fn reassign(
    cluster: &dyn Cluster,
    token: &str,
    previous: Option<&ObjectRef>,
    current: Option<&ObjectRef>,
) -> Result<(), ClusterError> {
    if let Some(current) = current {
        ensure(cluster, token, current).await?;
    }
    if let Some(previous) = previous {
        if Some(previous) != current {
            release(cluster, token, previous).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_token_format() {
        assert_eq!(
            owner_token("KeystoneAPI", "keystone"),
            "openstack.org/keystoneapi-keystone"
        );
        assert_eq!(
            owner_token("KeystoneService", "nova"),
            "openstack.org/keystoneservice-nova"
        );
    }
}
