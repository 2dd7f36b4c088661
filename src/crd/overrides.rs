//! # Service Overrides
//!
//! Per-endpoint customisation of the Kubernetes Services fronting keystone.
//! Only the `public` and `internal` endpoints exist; any other key or any
//! unknown field fails deserialisation, so a malformed override is refused
//! by admission instead of surfacing halfway through a reconciliation.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Endpoint a Service override applies to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Public,
    Internal,
}

impl Endpoint {
    pub const ALL: [Endpoint; 2] = [Endpoint::Public, Endpoint::Internal];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Public => crate::constants::ENDPOINT_PUBLIC,
            Endpoint::Internal => crate::constants::ENDPOINT_INTERNAL,
        }
    }

    /// Name of the Kubernetes Service exposing this endpoint
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("{}-{}", crate::constants::SERVICE_NAME, self.as_str())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes Service type an endpoint may be exposed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ServiceType {
    ClusterIP,
    LoadBalancer,
    NodePort,
}

impl ServiceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::NodePort => "NodePort",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OverrideMetadata {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OverrideServiceSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<ServiceType>,
}

/// Override for one endpoint's Service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<OverrideMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<OverrideServiceSpec>,
    /// Externally reachable URL replacing the cluster-local endpoint
    #[serde(default, rename = "endpointURL", skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

impl ServiceOverride {
    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .map(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .map(|m| m.labels.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        self.spec
            .as_ref()
            .and_then(|s| s.type_)
            .unwrap_or(ServiceType::ClusterIP)
    }
}

/// `spec.override` of a KeystoneAPI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiOverrideSpec {
    #[serde(default)]
    pub service: BTreeMap<Endpoint, ServiceOverride>,
}

impl ApiOverrideSpec {
    #[must_use]
    pub fn for_endpoint(&self, endpoint: Endpoint) -> Option<&ServiceOverride> {
        self.service.get(&endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognised_endpoints_deserialize() {
        let yaml = r#"
service:
  public:
    metadata:
      annotations:
        metallb.universe.tf/address-pool: ctlplane
      labels:
        tier: edge
    spec:
      type: LoadBalancer
    endpointURL: https://keystone.example.com
  internal: {}
"#;
        let spec: ApiOverrideSpec = serde_yaml::from_str(yaml).unwrap();
        let public = spec.for_endpoint(Endpoint::Public).unwrap();
        assert_eq!(public.service_type(), ServiceType::LoadBalancer);
        assert_eq!(
            public.endpoint_url.as_deref(),
            Some("https://keystone.example.com")
        );
        assert_eq!(public.labels().get("tier").map(String::as_str), Some("edge"));
        let internal = spec.for_endpoint(Endpoint::Internal).unwrap();
        assert_eq!(internal.service_type(), ServiceType::ClusterIP);
        assert!(internal.annotations().is_empty());
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let yaml = "service:\n  admin: {}\n";
        assert!(serde_yaml::from_str::<ApiOverrideSpec>(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "service:\n  public:\n    endpointUrl: http://typo\n";
        assert!(serde_yaml::from_str::<ApiOverrideSpec>(yaml).is_err());
    }
}
