//! # Types
//!
//! Error type and shared context of both reconcilers.

use crate::cluster::{Cluster, ClusterError};
use crate::config::ControllerConfig;
use crate::controller::backoff::BackoffState;
use crate::controller::fernet::FernetError;
use crate::identity::{IdentityConnector, IdentityError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Cluster error: {0}")]
    Cluster(#[source] ClusterError),
    /// Optimistic-concurrency collision, retried right away
    #[error("Conflict writing {0}")]
    Conflict(String),
    #[error("Identity backend error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

impl From<ClusterError> for ReconcilerError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::Conflict(what) => ReconcilerError::Conflict(what),
            other => ReconcilerError::Cluster(other),
        }
    }
}

impl From<FernetError> for ReconcilerError {
    fn from(error: FernetError) -> Self {
        match error {
            FernetError::Cluster(e) => e.into(),
            other => ReconcilerError::ReconciliationFailed(anyhow::Error::new(other)),
        }
    }
}

impl ReconcilerError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Conflict(_))
    }
}

/// Shared state handed to every reconciliation
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub identity: Arc<dyn IdentityConnector>,
    pub config: ControllerConfig,
    /// Backoff per object (namespace/name), owned by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn Cluster>,
        identity: Arc<dyn IdentityConnector>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            identity,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Key of an object in `backoff_states`
    #[must_use]
    pub fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
        format!("{}/{}/{}", kind, namespace, name)
    }

    /// Forget the error history of an object after a successful pass
    pub fn reset_backoff(&self, kind: &str, namespace: &str, name: &str) -> bool {
        let key = Self::backoff_key(kind, namespace, name);
        match self.backoff_states.lock() {
            Ok(mut states) => states.get_mut(&key).is_some_and(|state| {
                let had_errors = state.error_count > 0;
                state.reset();
                had_errors
            }),
            Err(_) => false,
        }
    }

    /// Drop the error history of an object that is gone
    pub fn forget_backoff(&self, kind: &str, namespace: &str, name: &str) {
        let key = Self::backoff_key(kind, namespace, name);
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(&key);
        }
    }
}
