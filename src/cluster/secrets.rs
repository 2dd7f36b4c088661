//! # Secret Material
//!
//! Resolves one field of a referenced secret. A missing secret or field is
//! reported as a lookup outcome rather than an error so callers can turn it
//! into a bounded requeue.

use super::{Cluster, ClusterError};
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

#[derive(Debug)]
pub enum SecretLookup {
    Found(Zeroizing<String>),
    SecretMissing,
    FieldMissing,
}

/// Look up `field` in secret `name`
pub async fn resolve_field(
    cluster: &dyn Cluster,
    namespace: &str,
    name: &str,
    field: &str,
) -> Result<SecretLookup, ClusterError> {
    let Some(secret) = cluster.get_secret(namespace, name).await? else {
        return Ok(SecretLookup::SecretMissing);
    };
    Ok(match field_value(&secret, field) {
        Some(value) => SecretLookup::Found(value),
        None => SecretLookup::FieldMissing,
    })
}

/// Decoded value of `field`, looking at `data` and then `stringData`
#[must_use]
pub fn field_value(secret: &Secret, field: &str) -> Option<Zeroizing<String>> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(field)) {
        return Some(Zeroizing::new(String::from_utf8_lossy(&bytes.0).into_owned()));
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(field))
        .map(|v| Zeroizing::new(v.clone()))
}

/// All fields of a secret as strings, used for config rendering and hashing
#[must_use]
pub fn string_fields(secret: &Secret) -> BTreeMap<String, String> {
    let mut fields: BTreeMap<String, String> = secret
        .string_data
        .clone()
        .unwrap_or_default();
    if let Some(data) = secret.data.as_ref() {
        for (key, value) in data {
            fields.insert(key.clone(), String::from_utf8_lossy(&value.0).into_owned());
        }
    }
    fields
}
