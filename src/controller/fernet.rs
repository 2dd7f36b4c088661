//! # Fernet Key Ring
//!
//! Maintains the ordered ring of fernet keys keystone signs and verifies
//! tokens with. Index 0 is the primary (signing) key; higher indices are
//! older keys kept only to verify tokens already in flight.
//!
//! Per pass exactly one of the following happens, in this precedence:
//!
//! 1. **create**: no ring yet, generate `size` keys
//! 2. **resize**: configured size differs, append fresh keys at the tail or
//!    truncate the tail; the primary is never touched
//! 3. **rotate**: the rotation period elapsed, a fresh key is inserted at
//!    index 0, every key moves up one index and the last one is discarded
//!
//! The ring lives in a Secret named after the KeystoneAPI with data keys
//! `FernetKeys0`..`FernetKeysN-1` and the last rotation recorded in the
//! `keystone.openstack.org/rotatedat` annotation.

use crate::cluster::{Cluster, ClusterError};
use crate::constants::{
    FERNET_KEY_LEN, FERNET_KEY_PREFIX, FERNET_ROTATED_AT_ANNOTATION, MIN_FERNET_KEYS,
};
use crate::controller::hash;
use crate::crd::KeystoneAPI;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Time between two rotations
pub const ROTATION_PERIOD_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum FernetError {
    #[error("Failed to generate fernet key material")]
    Random,
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// What a pass did to the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingChange {
    Unchanged,
    Created,
    Resized { from: usize, to: usize },
    Rotated,
}

/// Source of fresh key material
///
/// Held across awaits inside a reconciliation, which must stay `Send`.
pub trait KeySource: Send {
    fn generate(&mut self) -> Result<String, FernetError>;
}

/// Keys from the system CSPRNG, URL-safe base64 encoded as fernet expects
pub struct SystemKeySource {
    rng: SystemRandom,
}

impl Default for SystemKeySource {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl std::fmt::Debug for SystemKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemKeySource").finish_non_exhaustive()
    }
}

impl KeySource for SystemKeySource {
    fn generate(&mut self) -> Result<String, FernetError> {
        let mut key = [0u8; FERNET_KEY_LEN];
        self.rng
            .fill(&mut key)
            .map_err(|ring::error::Unspecified| FernetError::Random)?;
        Ok(URL_SAFE.encode(key))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FernetRing {
    keys: Vec<String>,
    rotated_at: Option<DateTime<Utc>>,
}

impl FernetRing {
    #[must_use]
    pub fn new(keys: Vec<String>, rotated_at: Option<DateTime<Utc>>) -> Self {
        Self { keys, rotated_at }
    }

    /// Read the ring from a secret; keys are taken from index 0 up to the first gap
    #[must_use]
    pub fn from_secret(secret: &Secret) -> Self {
        let data = secret.data.clone().unwrap_or_default();
        let keys = (0..)
            .map_while(|i| data.get(&key_name(i)))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .collect();
        let rotated_at = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FERNET_ROTATED_AT_ANNOTATION))
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        Self { keys, rotated_at }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn rotated_at(&self) -> Option<DateTime<Utc>> {
        self.rotated_at
    }

    /// When the next rotation falls due
    #[must_use]
    pub fn next_rotation(&self) -> Option<DateTime<Utc>> {
        self.rotated_at
            .map(|ts| ts + Duration::hours(ROTATION_PERIOD_HOURS))
    }

    /// Bring the ring to `size` keys or rotate it when due
    pub fn reconcile(
        &mut self,
        size: usize,
        now: DateTime<Utc>,
        source: &mut dyn KeySource,
    ) -> Result<RingChange, FernetError> {
        if self.keys.is_empty() {
            self.keys = (0..size)
                .map(|_| source.generate())
                .collect::<Result<_, _>>()?;
            self.rotated_at = Some(now);
            return Ok(RingChange::Created);
        }

        let current = self.keys.len();
        if current != size {
            if size > current {
                for _ in current..size {
                    self.keys.push(source.generate()?);
                }
            } else {
                self.keys.truncate(size);
            }
            if self.rotated_at.is_none() {
                self.rotated_at = Some(now);
            }
            return Ok(RingChange::Resized {
                from: current,
                to: size,
            });
        }

        let due = self.next_rotation().is_none_or(|next| now >= next);
        if !due {
            return Ok(RingChange::Unchanged);
        }
        let fresh = source.generate()?;
        self.keys.pop();
        self.keys.insert(0, fresh);
        self.rotated_at = Some(now);
        Ok(RingChange::Rotated)
    }

    /// Secret data for this ring
    #[must_use]
    pub fn to_data(&self) -> BTreeMap<String, ByteString> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, k)| (key_name(i), ByteString(k.as_bytes().to_vec())))
            .collect()
    }

    /// Digest over the key material, part of the deployment input hash
    #[must_use]
    pub fn hash(&self) -> String {
        let entries: BTreeMap<String, &str> = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| (key_name(i), k.as_str()))
            .collect();
        hash::hash_map(&entries)
    }
}

fn key_name(index: usize) -> String {
    format!("{}{}", FERNET_KEY_PREFIX, index)
}

/// Result of ensuring the fernet secret
#[derive(Debug, Clone)]
pub struct FernetOutcome {
    pub change: RingChange,
    pub hash: String,
    pub next_rotation: Option<DateTime<Utc>>,
}

/// Load, reconcile and persist the ring of `api`
///
/// The secret is written only when the ring changed, as one apply, so an
/// interrupted pass leaves either the old or the new ring, never a mix.
pub async fn ensure_fernet_keys(
    cluster: &dyn Cluster,
    api: &KeystoneAPI,
    now: DateTime<Utc>,
    source: &mut dyn KeySource,
) -> Result<FernetOutcome, FernetError> {
    let namespace = api.metadata.namespace.clone().unwrap_or_default();
    let name = api.metadata.name.clone().unwrap_or_default();
    let size = usize::try_from(api.spec.fernet_max_active_keys.max(MIN_FERNET_KEYS))
        .unwrap_or_default();

    let mut ring = match cluster.get_secret(&namespace, &name).await? {
        Some(secret) => FernetRing::from_secret(&secret),
        None => FernetRing::default(),
    };
    let change = ring.reconcile(size, now, source)?;

    if change != RingChange::Unchanged {
        match change {
            RingChange::Rotated => {
                info!("🔑 Rotated fernet keys for {}/{}", namespace, name);
                crate::observability::metrics::increment_fernet_rotations();
            }
            RingChange::Resized { from, to } => {
                info!(
                    "🔑 Resized fernet key ring for {}/{} from {} to {}",
                    namespace, name, from, to
                );
                crate::observability::metrics::increment_fernet_resizes();
            }
            _ => info!("🔑 Created fernet key ring for {}/{}", namespace, name),
        }
        cluster
            .apply_secret(&ring_secret(api, &namespace, &name, &ring))
            .await?;
    }

    Ok(FernetOutcome {
        change,
        hash: ring.hash(),
        next_rotation: ring.next_rotation(),
    })
}

fn ring_secret(api: &KeystoneAPI, namespace: &str, name: &str, ring: &FernetRing) -> Secret {
    let annotations = ring
        .rotated_at()
        .map(|ts| {
            BTreeMap::from([(
                FERNET_ROTATED_AT_ANNOTATION.to_string(),
                ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            )])
        });
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            labels: Some(crate::controller::keystone_api::resources::service_labels(api)),
            owner_references: api.controller_owner_ref(&()).map(|r| vec![r]),
            ..ObjectMeta::default()
        },
        data: Some(ring.to_data()),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic keys `gen0`, `gen1`, ... in generation order
    struct Counter(usize);

    impl KeySource for Counter {
        fn generate(&mut self) -> Result<String, FernetError> {
            let key = format!("gen{}", self.0);
            self.0 += 1;
            Ok(key)
        }
    }

    fn ring(n: usize, rotated_at: DateTime<Utc>) -> FernetRing {
        FernetRing::new((0..n).map(|i| format!("k{}", i)).collect(), Some(rotated_at))
    }

    #[test]
    fn test_created_ring_has_configured_size() {
        let mut r = FernetRing::default();
        let now = Utc::now();
        assert_eq!(r.reconcile(3, now, &mut Counter(0)).unwrap(), RingChange::Created);
        assert_eq!(r.len(), 3);
        assert_eq!(r.rotated_at(), Some(now));
    }

    #[test]
    fn test_shrink_removes_highest_index_only() {
        let now = Utc::now();
        let mut r = ring(5, now);
        let change = r.reconcile(4, now, &mut Counter(0)).unwrap();
        assert_eq!(change, RingChange::Resized { from: 5, to: 4 });
        assert_eq!(r.keys(), ["k0", "k1", "k2", "k3"]);
    }

    #[test]
    fn test_grow_appends_without_touching_existing() {
        let now = Utc::now();
        let mut r = ring(5, now);
        r.reconcile(6, now, &mut Counter(0)).unwrap();
        assert_eq!(r.keys(), ["k0", "k1", "k2", "k3", "k4", "gen0"]);
    }

    #[test]
    fn test_rotation_shifts_and_drops_last() {
        let now = Utc::now();
        let mut r = ring(5, now - Duration::hours(25));
        assert_eq!(r.reconcile(5, now, &mut Counter(0)).unwrap(), RingChange::Rotated);
        assert_eq!(r.keys(), ["gen0", "k0", "k1", "k2", "k3"]);
        assert!(!r.keys().contains(&"k4".to_string()));
        assert_eq!(r.rotated_at(), Some(now));
    }

    #[test]
    fn test_no_rotation_inside_window() {
        let now = Utc::now();
        let mut r = ring(5, now - Duration::hours(23));
        let before = r.clone();
        assert_eq!(r.reconcile(5, now, &mut Counter(0)).unwrap(), RingChange::Unchanged);
        assert_eq!(r, before);
    }

    #[test]
    fn test_resize_takes_precedence_over_rotation() {
        let now = Utc::now();
        let mut r = ring(5, now - Duration::hours(48));
        let change = r.reconcile(4, now, &mut Counter(0)).unwrap();
        assert_eq!(change, RingChange::Resized { from: 5, to: 4 });
        assert_eq!(r.keys()[0], "k0");
        assert_eq!(r.reconcile(4, now, &mut Counter(0)).unwrap(), RingChange::Rotated);
    }

    #[test]
    fn test_secret_round_trip_stops_at_gap() {
        let now = Utc::now();
        let r = ring(3, now);
        let mut data = r.to_data();
        data.insert("FernetKeys7".to_string(), ByteString(b"stray".to_vec()));
        let secret = Secret {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    FERNET_ROTATED_AT_ANNOTATION.to_string(),
                    "2024-01-01T00:00:00Z".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        };
        let read = FernetRing::from_secret(&secret);
        assert_eq!(read.keys(), r.keys());
        assert_eq!(
            read.rotated_at().map(|t| t.to_rfc3339()),
            Some("2024-01-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_hash_tracks_ring_changes() {
        let now = Utc::now();
        let mut r = ring(5, now - Duration::hours(25));
        let before = r.hash();
        r.reconcile(5, now, &mut Counter(0)).unwrap();
        assert_ne!(before, r.hash());
    }

    #[test]
    fn test_system_keys_are_fernet_sized() {
        let key = SystemKeySource::default().generate().unwrap();
        assert_eq!(URL_SAFE.decode(key).unwrap().len(), FERNET_KEY_LEN);
    }
}
