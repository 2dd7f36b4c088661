//! # Keystone REST Client
//!
//! reqwest client for the keystone v3 API.
//!
//! Authentication uses the password method scoped to the admin project; the
//! token returned in `X-Subject-Token` is sent as `X-Auth-Token` on every
//! subsequent request of the session. Keystone only filters services by
//! type server-side, so the name match happens here.

use super::{
    AdminCredentials, IdentityBackend, IdentityConnector, IdentityError, Project, Role,
    ServiceEntity, ServiceRequest, User, UserRequest,
};
use crate::observability::metrics;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, Instrument};
use zeroize::Zeroizing;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Deserialize)]
struct ServicesResponse {
    services: Vec<ServiceEntity>,
}

#[derive(Deserialize)]
struct ServiceResponse {
    service: ServiceEntity,
}

#[derive(Deserialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct ProjectResponse {
    project: Project,
}

#[derive(Deserialize)]
struct UsersResponse {
    users: Vec<User>,
}

#[derive(Deserialize)]
struct UserResponse {
    user: User,
}

#[derive(Deserialize)]
struct RolesResponse {
    roles: Vec<Role>,
}

#[derive(Deserialize)]
struct RoleResponse {
    role: Role,
}

/// Opens keystone sessions with a shared HTTP client
#[derive(Clone)]
pub struct KeystoneConnector {
    http_client: reqwest::Client,
}

impl std::fmt::Debug for KeystoneConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneConnector").finish_non_exhaustive()
    }
}

impl KeystoneConnector {
    /// Build a connector whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, IdentityError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Fatal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl IdentityConnector for KeystoneConnector {
    async fn connect(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<Arc<dyn IdentityBackend>, IdentityError> {
        let base_url = credentials.auth_url.trim_end_matches('/').to_string();
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": credentials.username,
                            "domain": { "id": credentials.domain },
                            "password": credentials.password.as_str(),
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": credentials.project,
                        "domain": { "id": credentials.domain },
                    }
                }
            }
        });

        let response = self
            .http_client
            .post(format!("{}/v3/auth/tokens", base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, "auth token").await?;
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                IdentityError::Fatal("Authentication response carried no token".to_string())
            })?;

        debug!("Authenticated against {} as {}", base_url, credentials.username);
        Ok(Arc::new(KeystoneClient {
            http_client: self.http_client.clone(),
            base_url,
            token: Zeroizing::new(token),
        }))
    }
}

/// One authenticated keystone session
pub struct KeystoneClient {
    http_client: reqwest::Client,
    base_url: String,
    token: Zeroizing<String>,
}

impl std::fmt::Debug for KeystoneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneClient")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

impl KeystoneClient {
    fn make_request(&self, method: Method, path: &str, body: Option<Value>) -> RequestBuilder {
        let url = format!("{}/v3/{}", self.base_url, path);
        let mut request = self
            .http_client
            .request(method, &url)
            .header(AUTH_TOKEN_HEADER, self.token.as_str());
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
    }

    /// Send a request, classify the outcome and record it
    async fn send(
        &self,
        operation: &'static str,
        entity: &str,
        request: RequestBuilder,
    ) -> Result<Response, IdentityError> {
        let span = tracing::debug_span!("identity.request", operation = operation, entity = entity);
        async move {
            let start = Instant::now();
            let result = match request.send().await {
                Ok(response) => check_status(response, entity).await,
                Err(e) => Err(transport_error(e)),
            };
            let outcome = match &result {
                Ok(_) => "success",
                Err(IdentityError::NotFound(_)) => "not_found",
                Err(IdentityError::Transient(_)) => "transient",
                Err(IdentityError::Fatal(_)) => "fatal",
            };
            metrics::record_identity_operation(operation, outcome, start.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }
}

async fn check_status(response: Response, entity: &str) -> Result<Response, IdentityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, entity, &body))
}

/// Map an HTTP failure onto the error taxonomy
#[must_use]
pub fn classify_status(status: StatusCode, entity: &str, body: &str) -> IdentityError {
    match status {
        StatusCode::NOT_FOUND => IdentityError::NotFound(entity.to_string()),
        // A create racing with another writer; the next pass adopts the winner.
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS => {
            IdentityError::Transient(format!("{} for {}: {}", status, entity, body))
        }
        s if s.is_server_error() => {
            IdentityError::Transient(format!("{} for {}: {}", status, entity, body))
        }
        _ => IdentityError::Fatal(format!("{} for {}: {}", status, entity, body)),
    }
}

fn transport_error(error: reqwest::Error) -> IdentityError {
    IdentityError::Transient(error.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, IdentityError> {
    response
        .json()
        .await
        .map_err(|e| IdentityError::Fatal(format!("Failed to decode response: {}", e)))
}

fn first_or_not_found<T>(items: Vec<T>, entity: String) -> Result<T, IdentityError> {
    items
        .into_iter()
        .next()
        .ok_or(IdentityError::NotFound(entity))
}

#[async_trait]
impl IdentityBackend for KeystoneClient {
    async fn get_service(
        &self,
        service_type: &str,
        name: &str,
    ) -> Result<ServiceEntity, IdentityError> {
        let entity = format!("service {}/{}", service_type, name);
        let request = self
            .make_request(Method::GET, "services", None)
            .query(&[("type", service_type)]);
        let listed: ServicesResponse = decode(self.send("get_service", &entity, request).await?).await?;
        first_or_not_found(
            listed
                .services
                .into_iter()
                .filter(|s| s.name == name)
                .collect(),
            entity,
        )
    }

    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceEntity, IdentityError> {
        let entity = format!("service {}/{}", request.service_type, request.name);
        let body = json!({ "service": request });
        let http = self.make_request(Method::POST, "services", Some(body));
        let created: ServiceResponse = decode(self.send("create_service", &entity, http).await?).await?;
        Ok(created.service)
    }

    async fn update_service(
        &self,
        id: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceEntity, IdentityError> {
        let body = json!({
            "service": {
                "description": request.description,
                "enabled": request.enabled,
            }
        });
        let http = self.make_request(Method::PATCH, &format!("services/{}", id), Some(body));
        let updated: ServiceResponse =
            decode(self.send("update_service", &format!("service {}", id), http).await?).await?;
        Ok(updated.service)
    }

    async fn delete_service(&self, id: &str) -> Result<(), IdentityError> {
        let http = self.make_request(Method::DELETE, &format!("services/{}", id), None);
        self.send("delete_service", &format!("service {}", id), http)
            .await?;
        Ok(())
    }

    async fn get_project(&self, name: &str, domain_id: &str) -> Result<Project, IdentityError> {
        let entity = format!("project {}", name);
        let http = self
            .make_request(Method::GET, "projects", None)
            .query(&[("name", name), ("domain_id", domain_id)]);
        let listed: ProjectsResponse = decode(self.send("get_project", &entity, http).await?).await?;
        first_or_not_found(listed.projects, entity)
    }

    async fn create_project(&self, name: &str, domain_id: &str) -> Result<Project, IdentityError> {
        let body = json!({
            "project": {
                "name": name,
                "domain_id": domain_id,
                "description": format!("{} project", name),
            }
        });
        let http = self.make_request(Method::POST, "projects", Some(body));
        let created: ProjectResponse =
            decode(self.send("create_project", &format!("project {}", name), http).await?).await?;
        Ok(created.project)
    }

    async fn get_user(&self, name: &str, domain_id: &str) -> Result<User, IdentityError> {
        let entity = format!("user {}", name);
        let http = self
            .make_request(Method::GET, "users", None)
            .query(&[("name", name), ("domain_id", domain_id)]);
        let listed: UsersResponse = decode(self.send("get_user", &entity, http).await?).await?;
        first_or_not_found(listed.users, entity)
    }

    async fn create_user(&self, request: &UserRequest) -> Result<User, IdentityError> {
        let body = json!({
            "user": {
                "name": request.name,
                "password": request.password.as_str(),
                "domain_id": request.domain_id,
                "default_project_id": request.default_project_id,
            }
        });
        let http = self.make_request(Method::POST, "users", Some(body));
        let created: UserResponse =
            decode(self.send("create_user", &format!("user {}", request.name), http).await?)
                .await?;
        Ok(created.user)
    }

    async fn delete_user(&self, id: &str) -> Result<(), IdentityError> {
        let http = self.make_request(Method::DELETE, &format!("users/{}", id), None);
        self.send("delete_user", &format!("user {}", id), http).await?;
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<Role, IdentityError> {
        let entity = format!("role {}", name);
        let http = self
            .make_request(Method::GET, "roles", None)
            .query(&[("name", name)]);
        let listed: RolesResponse = decode(self.send("get_role", &entity, http).await?).await?;
        first_or_not_found(listed.roles, entity)
    }

    async fn create_role(&self, name: &str) -> Result<Role, IdentityError> {
        let body = json!({ "role": { "name": name } });
        let http = self.make_request(Method::POST, "roles", Some(body));
        let created: RoleResponse =
            decode(self.send("create_role", &format!("role {}", name), http).await?).await?;
        Ok(created.role)
    }

    async fn assign_user_role(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), IdentityError> {
        let path = format!("projects/{}/users/{}/roles/{}", project_id, user_id, role_id);
        let http = self.make_request(Method::PUT, &path, None);
        self.send(
            "assign_user_role",
            &format!("role assignment {}/{}/{}", project_id, user_id, role_id),
            http,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::NOT_FOUND, "service", "").is_not_found());
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "service", ""),
            IdentityError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "user nova", "duplicate"),
            IdentityError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "auth token", ""),
            IdentityError::Fatal(_)
        ));
    }

    #[test]
    fn test_service_entity_decodes_catalog_payload() {
        let payload = r#"{"services":[{"id":"abc","type":"compute","name":"nova","enabled":false,"links":{}}]}"#;
        let listed: ServicesResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(listed.services[0].service_type, "compute");
        assert!(!listed.services[0].enabled);
        assert_eq!(listed.services[0].description, "");
    }
}
