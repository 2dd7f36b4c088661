//! # KeystoneService
//!
//! Registration of one OpenStack service (catalog entry plus service user)
//! in the keystone of the same namespace.

use crate::crd::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keystone.openstack.org",
    version = "v1beta1",
    kind = "KeystoneService",
    namespaced,
    status = "KeystoneServiceStatus",
    printcolumn = r#"{"name":"ServiceID","type":"string","jsonPath":".status.serviceID"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[0].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeystoneServiceSpec {
    /// Catalog type, e.g. `compute`
    pub service_type: String,
    /// Catalog name, e.g. `nova`
    pub service_name: String,
    #[serde(default)]
    pub service_description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Name of the service user
    pub service_user: String,
    /// Secret holding the service user's password
    pub secret: String,
    /// Key of the password within `secret`
    pub password_selector: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeystoneServiceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, rename = "serviceID", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KeystoneService {
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.service_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

fn default_enabled() -> bool {
    true
}
