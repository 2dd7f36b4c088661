//! # Conditions
//!
//! Wire representation of the readiness conditions both resources report.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// How bad a failing condition is
///
/// Variants are declared from most to least severe so the derived ordering
/// can be used directly when picking the condition Ready should mirror.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Machine-readable reason attached to a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionReason {
    /// Seeded on the first pass, nothing evaluated yet
    Init,
    Ready,
    /// Waiting on something the operator asked for
    Requested,
    Error,
    NotFound,
}

/// Every condition type either resource can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Ready,
    InputReady,
    #[serde(rename = "DBReady")]
    DbReady,
    #[serde(rename = "RabbitMqTransportURLReady")]
    RabbitMqTransportUrlReady,
    MemcachedReady,
    ServiceConfigReady,
    #[serde(rename = "DBSyncReady")]
    DbSyncReady,
    CreateServiceReady,
    BootstrapReady,
    NetworkAttachmentsReady,
    DeploymentReady,
    CronJobReady,
    #[serde(rename = "TLSInputReady")]
    TlsInputReady,
    TopologyReady,
    #[serde(rename = "KeystoneAPIReady")]
    KeystoneApiReady,
    AdminServiceClientReady,
    #[serde(rename = "KeystoneServiceOSServiceReady")]
    KeystoneServiceOsServiceReady,
    #[serde(rename = "KeystoneServiceOSUserReady")]
    KeystoneServiceOsUserReady,
}

impl ConditionType {
    /// Name as written to the status
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::InputReady => "InputReady",
            ConditionType::DbReady => "DBReady",
            ConditionType::RabbitMqTransportUrlReady => "RabbitMqTransportURLReady",
            ConditionType::MemcachedReady => "MemcachedReady",
            ConditionType::ServiceConfigReady => "ServiceConfigReady",
            ConditionType::DbSyncReady => "DBSyncReady",
            ConditionType::CreateServiceReady => "CreateServiceReady",
            ConditionType::BootstrapReady => "BootstrapReady",
            ConditionType::NetworkAttachmentsReady => "NetworkAttachmentsReady",
            ConditionType::DeploymentReady => "DeploymentReady",
            ConditionType::CronJobReady => "CronJobReady",
            ConditionType::TlsInputReady => "TLSInputReady",
            ConditionType::TopologyReady => "TopologyReady",
            ConditionType::KeystoneApiReady => "KeystoneAPIReady",
            ConditionType::AdminServiceClientReady => "AdminServiceClientReady",
            ConditionType::KeystoneServiceOsServiceReady => "KeystoneServiceOSServiceReady",
            ConditionType::KeystoneServiceOsUserReady => "KeystoneServiceOSUserReady",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    /// RFC3339 timestamp of the last status change
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}
