//! # Dependency Gate
//!
//! Orders the stages of a KeystoneAPI reconciliation and translates each
//! stage's result into its sub-condition. A stage either lets the pass move
//! on within the same invocation, or stops it with a bounded requeue while a
//! prerequisite is missing or still converging.

use crate::controller::conditions::ConditionSet;
use crate::controller::types::ReconcilerError;
use crate::crd::{ConditionReason, ConditionType, Severity};
use std::time::Duration;
use tracing::debug;

/// Reconciliation stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    TlsInput,
    Database,
    MessageBus,
    Cache,
    ServiceConfig,
    DbSync,
    CreateService,
    Bootstrap,
    Topology,
    NetworkAttachments,
    Deployment,
    CronJob,
}

impl Stage {
    pub const ORDER: [Stage; 13] = [
        Stage::Input,
        Stage::TlsInput,
        Stage::Database,
        Stage::MessageBus,
        Stage::Cache,
        Stage::ServiceConfig,
        Stage::DbSync,
        Stage::CreateService,
        Stage::Bootstrap,
        Stage::Topology,
        Stage::NetworkAttachments,
        Stage::Deployment,
        Stage::CronJob,
    ];

    /// Sub-condition the stage reports on
    #[must_use]
    pub fn condition(self) -> ConditionType {
        match self {
            Stage::Input => ConditionType::InputReady,
            Stage::TlsInput => ConditionType::TlsInputReady,
            Stage::Database => ConditionType::DbReady,
            Stage::MessageBus => ConditionType::RabbitMqTransportUrlReady,
            Stage::Cache => ConditionType::MemcachedReady,
            Stage::ServiceConfig => ConditionType::ServiceConfigReady,
            Stage::DbSync => ConditionType::DbSyncReady,
            Stage::CreateService => ConditionType::CreateServiceReady,
            Stage::Bootstrap => ConditionType::BootstrapReady,
            Stage::Topology => ConditionType::TopologyReady,
            Stage::NetworkAttachments => ConditionType::NetworkAttachmentsReady,
            Stage::Deployment => ConditionType::DeploymentReady,
            Stage::CronJob => ConditionType::CronJobReady,
        }
    }
}

/// What a stage asks of the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Requeue(Duration),
}

/// Prerequisite does not exist: `False`/`NotFound`, retry after `delay`
pub fn not_found(
    conditions: &mut ConditionSet,
    stage: Stage,
    delay: Duration,
    message: impl Into<String>,
) -> StageOutcome {
    let message = message.into();
    debug!("{:?} stage waiting: {}", stage, message);
    conditions.mark_false(
        stage.condition(),
        ConditionReason::NotFound,
        Severity::Warning,
        message,
    );
    StageOutcome::Requeue(delay)
}

/// Prerequisite exists but is not ready yet: `False`/`Requested`, retry after `delay`
pub fn waiting(
    conditions: &mut ConditionSet,
    stage: Stage,
    delay: Duration,
    message: impl Into<String>,
) -> StageOutcome {
    let message = message.into();
    debug!("{:?} stage waiting: {}", stage, message);
    conditions.mark_false(
        stage.condition(),
        ConditionReason::Requested,
        Severity::Info,
        message,
    );
    StageOutcome::Requeue(delay)
}

/// Something the operator created ended in failure: `False`/`Error`, retry after `delay`
pub fn failed(
    conditions: &mut ConditionSet,
    stage: Stage,
    delay: Duration,
    message: impl Into<String>,
) -> StageOutcome {
    conditions.mark_false(
        stage.condition(),
        ConditionReason::Error,
        Severity::Error,
        message,
    );
    StageOutcome::Requeue(delay)
}

pub fn ready(
    conditions: &mut ConditionSet,
    stage: Stage,
    message: impl Into<String>,
) -> StageOutcome {
    conditions.mark_true(stage.condition(), message);
    StageOutcome::Continue
}

/// Record a stage error on its sub-condition before handing it back
///
/// Conflicts are left off the conditions; the pass is retried right away.
pub fn settle(
    conditions: &mut ConditionSet,
    stage: Stage,
    result: Result<StageOutcome, ReconcilerError>,
) -> Result<StageOutcome, ReconcilerError> {
    if let Err(error) = &result {
        if !error.is_conflict() {
            conditions.mark_false(
                stage.condition(),
                ConditionReason::Error,
                Severity::Error,
                error.to_string(),
            );
        }
    }
    result
}
