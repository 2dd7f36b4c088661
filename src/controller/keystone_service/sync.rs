//! # Identity Synchronizer
//!
//! Converges keystone's own records of a registered service towards the
//! desired shape. Every entity is looked up by name first and only created
//! when missing, so a repeated or interrupted pass adopts what an earlier
//! one already created instead of duplicating it.

use crate::constants::{DEFAULT_DOMAIN, SERVICE_PROJECT, SERVICE_USER_ROLES};
use crate::identity::{
    IdentityBackend, IdentityError, Project, Role, ServiceEntity, ServiceRequest, User,
    UserRequest,
};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub struct Synchronizer<'a> {
    backend: &'a dyn IdentityBackend,
}

impl<'a> Synchronizer<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn IdentityBackend) -> Self {
        Self { backend }
    }

    /// Create the service, or adopt the existing (type, name) entry
    ///
    /// An adopted entry is only updated when `enabled` or the description differ.
    pub async fn reconcile_service(
        &self,
        desired: &ServiceRequest,
    ) -> Result<ServiceEntity, IdentityError> {
        match self
            .backend
            .get_service(&desired.service_type, &desired.name)
            .await
        {
            Ok(existing) => {
                if existing.enabled == desired.enabled
                    && existing.description == desired.description
                {
                    debug!("Service {} ({}) up to date", desired.name, existing.id);
                    return Ok(existing);
                }
                info!("Updating service {} ({})", desired.name, existing.id);
                self.backend.update_service(&existing.id, desired).await
            }
            Err(IdentityError::NotFound(_)) => {
                info!("Creating service {} of type {}", desired.name, desired.service_type);
                self.backend.create_service(desired).await
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_project(&self, name: &str) -> Result<Project, IdentityError> {
        match self.backend.get_project(name, DEFAULT_DOMAIN).await {
            Err(IdentityError::NotFound(_)) => {
                self.backend.create_project(name, DEFAULT_DOMAIN).await
            }
            other => other,
        }
    }

    async fn ensure_role(&self, name: &str) -> Result<Role, IdentityError> {
        match self.backend.get_role(name).await {
            Err(IdentityError::NotFound(_)) => self.backend.create_role(name).await,
            other => other,
        }
    }

    /// Ensure the service user exists in the service project with the service roles
    pub async fn reconcile_user(
        &self,
        name: &str,
        password: Zeroizing<String>,
    ) -> Result<User, IdentityError> {
        let project = self.ensure_project(SERVICE_PROJECT).await?;
        let user = match self.backend.get_user(name, DEFAULT_DOMAIN).await {
            Err(IdentityError::NotFound(_)) => {
                info!("Creating user {}", name);
                self.backend
                    .create_user(&UserRequest {
                        name: name.to_string(),
                        password,
                        domain_id: DEFAULT_DOMAIN.to_string(),
                        default_project_id: project.id.clone(),
                    })
                    .await?
            }
            other => other?,
        };
        for role_name in SERVICE_USER_ROLES {
            let role = self.ensure_role(role_name).await?;
            self.backend
                .assign_user_role(&project.id, &user.id, &role.id)
                .await?;
        }
        Ok(user)
    }

    /// Delete the service user; a user that is already gone is fine
    pub async fn delete_user(&self, name: &str) -> Result<(), IdentityError> {
        let user = match self.backend.get_user(name, DEFAULT_DOMAIN).await {
            Ok(user) => user,
            Err(IdentityError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.backend.delete_user(&user.id).await {
            Ok(()) | Err(IdentityError::NotFound(_)) => {
                info!("Deleted user {}", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the service entry; a service that is already gone is fine
    pub async fn delete_service(&self, id: &str) -> Result<(), IdentityError> {
        match self.backend.delete_service(id).await {
            Ok(()) | Err(IdentityError::NotFound(_)) => {
                info!("Deleted service {}", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
