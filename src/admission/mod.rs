//! # Admission
//!
//! Defaulting and validation of KeystoneAPI objects, served to the API
//! server by [`webhook`].
//!
//! The default image is not global state: a [`Defaulter`] is built once
//! from the operator configuration and handed to the HTTP server.

pub mod webhook;

use crate::constants::MIN_FERNET_KEYS;
use crate::crd::{KeystoneAPI, KeystoneAPISpec};
use kube::ResourceExt;
use thiserror::Error;

/// A rejected field, reported back to the user verbatim
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Joins field errors into one admission message
#[must_use]
pub fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fills in spec fields left empty by the user
#[derive(Debug, Clone)]
pub struct Defaulter {
    container_image: String,
}

impl Defaulter {
    #[must_use]
    pub fn new(container_image: impl Into<String>) -> Self {
        Self {
            container_image: container_image.into(),
        }
    }

    pub fn default_spec(&self, spec: &mut KeystoneAPISpec) {
        if spec.container_image.is_empty() {
            spec.container_image.clone_from(&self.container_image);
        }
    }
}

/// Checks applied on create
pub fn validate_create(api: &KeystoneAPI) -> Result<(), Vec<FieldError>> {
    let errors = validate_spec(&api.spec, api.namespace().as_deref());
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Checks applied on update. Nothing is immutable yet, so the new object
/// goes through the create checks.
pub fn validate_update(_old: &KeystoneAPI, new: &KeystoneAPI) -> Result<(), Vec<FieldError>> {
    validate_create(new)
}

fn validate_spec(spec: &KeystoneAPISpec, namespace: Option<&str>) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if spec.fernet_max_active_keys < MIN_FERNET_KEYS {
        errors.push(FieldError::new(
            "spec.fernetMaxActiveKeys",
            format!(
                "must be at least {}, got {}",
                MIN_FERNET_KEYS, spec.fernet_max_active_keys
            ),
        ));
    }

    if spec.replicas < 0 {
        errors.push(FieldError::new(
            "spec.replicas",
            format!("must not be negative, got {}", spec.replicas),
        ));
    }

    if spec.database_instance.is_empty() {
        errors.push(FieldError::new("spec.databaseInstance", "must not be empty"));
    }

    if let Some(topology) = &spec.topology_ref {
        if let (Some(referenced), Some(own)) = (topology.namespace.as_deref(), namespace) {
            if referenced != own {
                errors.push(FieldError::new(
                    "spec.topologyRef.namespace",
                    format!("must be {} (the object's namespace), got {}", own, referenced),
                ));
            }
        }
    }

    for (endpoint, service) in &spec.override_.service {
        let Some(url) = service.endpoint_url.as_deref() else {
            continue;
        };
        let field = format!("spec.override.service.{}.endpointURL", endpoint);
        match reqwest::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(FieldError::new(
                &field,
                format!("scheme must be http or https, got {}", parsed.scheme()),
            )),
            Err(e) => errors.push(FieldError::new(&field, format!("invalid URL: {}", e))),
        }
    }

    errors
}
