//! # KeystoneAPI
//!
//! Desired and observed state of one keystone deployment.

use crate::crd::condition::{Condition, ConditionType};
use crate::crd::overrides::{ApiOverrideSpec, Endpoint};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keystone.openstack.org",
    version = "v1beta1",
    kind = "KeystoneAPI",
    plural = "keystoneapis",
    namespaced,
    status = "KeystoneAPIStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[0].status"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.conditions[0].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeystoneAPISpec {
    /// Keystone image; filled in by the admission defaulter when empty
    #[serde(default)]
    pub container_image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Galera/MariaDB instance hosting the keystone database
    pub database_instance: String,
    /// MariaDBAccount used to reach the database
    #[serde(default = "default_database_account")]
    pub database_account: String,
    /// Secret carrying the admin password
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default)]
    pub password_selectors: PasswordSelector,
    #[serde(default = "default_admin")]
    pub admin_user: String,
    #[serde(default = "default_admin")]
    pub admin_project: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_rabbitmq_cluster")]
    pub rabbit_mq_cluster_name: String,
    #[serde(default = "default_memcached_instance")]
    pub memcached_instance: String,
    #[serde(default = "default_true", rename = "enableSecureRBAC")]
    pub enable_secure_rbac: bool,
    #[serde(default = "default_trust_flush_schedule")]
    pub trust_flush_schedule: String,
    #[serde(default)]
    pub trust_flush_args: String,
    #[serde(default)]
    pub trust_flush_suspend: bool,
    /// Number of fernet keys kept in the ring (at least 3)
    #[serde(default = "default_fernet_max_active_keys")]
    pub fernet_max_active_keys: i32,
    /// Request timeout of the API pods (seconds)
    #[serde(default = "default_api_timeout")]
    pub api_timeout: i64,
    /// Node selector for every pod the operator creates; an empty map means none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_ref: Option<TopologyRef>,
    /// NetworkAttachmentDefinitions attached to the API pods
    #[serde(default)]
    pub network_attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ApiTlsSpec>,
    #[serde(default, rename = "override")]
    pub override_: ApiOverrideSpec,
    /// Free-form ini appended to keystone.conf
    #[serde(default)]
    pub custom_service_config: String,
    /// Files replacing the generated defaults, keyed by file name
    #[serde(default)]
    pub default_config_overwrite: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub httpd_customization: Option<HttpdCustomization>,
    #[serde(default)]
    pub extra_mounts: Vec<ExtraMount>,
    /// Secret with one keystone domain configuration per realm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_realm_config: Option<String>,
    #[serde(default = "default_federation_mount_path")]
    pub federation_mount_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSelector {
    #[serde(default = "default_admin_password_selector")]
    pub admin: String,
}

impl Default for PasswordSelector {
    fn default() -> Self {
        Self {
            admin: default_admin_password_selector(),
        }
    }
}

/// Reference to a Topology object
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecretRef {
    pub secret_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiTlsSpec {
    /// Secret holding additional CA certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_name: Option<String>,
    /// Certificate secret per endpoint
    #[serde(default)]
    pub api: BTreeMap<Endpoint, TlsSecretRef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpdCustomization {
    /// Secret whose `*.conf` keys are included into the httpd vhosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config_secret: Option<String>,
}

/// An extra Secret or ConfigMap mounted into the API pods
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeystoneAPIStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Content hash per input category
    #[serde(default)]
    pub hash: BTreeMap<String, String>,
    /// Endpoint name to URL
    #[serde(default)]
    pub api_endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub ready_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_hostname: Option<String>,
    #[serde(default, rename = "transportURLSecret", skip_serializing_if = "Option::is_none")]
    pub transport_url_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_topology: Option<TopologyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_database_account: Option<String>,
}

impl KeystoneAPI {
    /// Whether the aggregate Ready condition is True
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == ConditionType::Ready && c.is_true())
        })
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Registered URL of an endpoint, once the services have been exposed
    #[must_use]
    pub fn endpoint_url(&self, endpoint: Endpoint) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.api_endpoints.get(endpoint.as_str()))
            .map(String::as_str)
    }

    /// Node selector to apply, `None` when unset or empty
    #[must_use]
    pub fn effective_node_selector(&self) -> Option<BTreeMap<String, String>> {
        self.spec
            .node_selector
            .as_ref()
            .filter(|selector| !selector.is_empty())
            .cloned()
    }

    #[must_use]
    pub fn tls_secret(&self, endpoint: Endpoint) -> Option<&str> {
        self.spec
            .tls
            .as_ref()
            .and_then(|tls| tls.api.get(&endpoint))
            .map(|s| s.secret_name.as_str())
    }

    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.spec
            .tls
            .as_ref()
            .is_some_and(|tls| tls.ca_bundle_secret_name.is_some() || !tls.api.is_empty())
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_database_account() -> String {
    "keystone".to_string()
}

fn default_secret() -> String {
    "osp-secret".to_string()
}

fn default_admin_password_selector() -> String {
    "AdminPassword".to_string()
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_region() -> String {
    "regionOne".to_string()
}

fn default_rabbitmq_cluster() -> String {
    "rabbitmq".to_string()
}

fn default_memcached_instance() -> String {
    "memcached".to_string()
}

fn default_true() -> bool {
    true
}

fn default_trust_flush_schedule() -> String {
    "1 * * * *".to_string()
}

fn default_fernet_max_active_keys() -> i32 {
    crate::constants::DEFAULT_FERNET_MAX_ACTIVE_KEYS
}

fn default_api_timeout() -> i64 {
    60
}

fn default_federation_mount_path() -> String {
    crate::constants::DEFAULT_FEDERATION_MOUNT_PATH.to_string()
}
