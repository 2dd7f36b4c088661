//! # Custom Resource Definitions
//!
//! - `KeystoneAPI`: a keystone deployment and everything it depends on
//! - `KeystoneService`: a service catalog entry with its service user

pub mod condition;
pub mod keystone_api;
pub mod keystone_service;
pub mod overrides;

pub use condition::{Condition, ConditionReason, ConditionStatus, ConditionType, Severity};
pub use keystone_api::{
    ApiTlsSpec, ExtraMount, HttpdCustomization, KeystoneAPI, KeystoneAPISpec, KeystoneAPIStatus,
    PasswordSelector, TlsSecretRef, TopologyRef,
};
pub use keystone_service::{KeystoneService, KeystoneServiceSpec, KeystoneServiceStatus};
pub use overrides::{
    ApiOverrideSpec, Endpoint, OverrideMetadata, OverrideServiceSpec, ServiceOverride, ServiceType,
};
