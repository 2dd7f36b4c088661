//! # Identity Backend
//!
//! Narrow facade over the keystone v3 API covering exactly the entities the
//! operator manages: services, projects, users, roles and role assignments.
//!
//! Every operation reports failures as an [`IdentityError`]:
//! - `NotFound`: the entity does not exist (yet); callers treat this as a
//!   normal "create it" signal, never as a failure
//! - `Transient`: network trouble, timeouts, 5xx and 429; retried with backoff
//! - `Fatal`: anything else (bad credentials, rejected payloads)
//!
//! Implementations:
//! - `KeystoneClient`: reqwest-based client for the keystone REST API

pub mod rest;

pub use rest::{KeystoneClient, KeystoneConnector};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Transient identity backend error: {0}")]
    Transient(String),
    #[error("Identity backend error: {0}")]
    Fatal(String),
}

impl IdentityError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, IdentityError::NotFound(_))
    }
}

/// A service catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

/// Desired shape of a service catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRequest {
    #[serde(rename = "type")]
    pub service_type: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub default_project_id: Option<String>,
}

/// Desired shape of a user
#[derive(Debug, Clone)]
pub struct UserRequest {
    pub name: String,
    pub password: Zeroizing<String>,
    pub domain_id: String,
    pub default_project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
}

fn enabled_by_default() -> bool {
    true
}

/// Operations against one authenticated identity backend session
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Look up a service by its (type, name) pair
    async fn get_service(&self, service_type: &str, name: &str)
        -> Result<ServiceEntity, IdentityError>;

    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceEntity, IdentityError>;

    async fn update_service(
        &self,
        id: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceEntity, IdentityError>;

    async fn delete_service(&self, id: &str) -> Result<(), IdentityError>;

    async fn get_project(&self, name: &str, domain_id: &str) -> Result<Project, IdentityError>;

    async fn create_project(&self, name: &str, domain_id: &str) -> Result<Project, IdentityError>;

    async fn get_user(&self, name: &str, domain_id: &str) -> Result<User, IdentityError>;

    async fn create_user(&self, request: &UserRequest) -> Result<User, IdentityError>;

    async fn delete_user(&self, id: &str) -> Result<(), IdentityError>;

    async fn get_role(&self, name: &str) -> Result<Role, IdentityError>;

    async fn create_role(&self, name: &str) -> Result<Role, IdentityError>;

    /// Grant `role_id` to `user_id` on `project_id`; granting twice is a no-op
    async fn assign_user_role(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), IdentityError>;
}

/// Credentials used to open an admin session
#[derive(Clone)]
pub struct AdminCredentials {
    /// Keystone endpoint, without the `/v3` suffix
    pub auth_url: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub project: String,
    pub domain: String,
    pub region: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("project", &self.project)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Opens authenticated [`IdentityBackend`] sessions
#[async_trait]
pub trait IdentityConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<Arc<dyn IdentityBackend>, IdentityError>;
}
