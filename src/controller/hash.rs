//! # Content Hashes
//!
//! Stable SHA-256 digests of rendered inputs. A changed digest is what makes
//! Jobs re-run and the Deployment roll.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Digest of a sorted key/value map
#[must_use]
pub fn hash_map<V: AsRef<[u8]>>(entries: &BTreeMap<String, V>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_ref());
        hasher.update([0u8]);
    }
    hex(&hasher.finalize())
}

/// Digest of several already computed hashes, order sensitive
#[must_use]
pub fn combine<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = BTreeMap::from([("k".to_string(), "v".to_string())]);
        let b = BTreeMap::from([("k".to_string(), "w".to_string())]);
        assert_eq!(hash_map(&a), hash_map(&a.clone()));
        assert_ne!(hash_map(&a), hash_map(&b));
        assert_eq!(hash_map(&a).len(), 64);
    }

    #[test]
    fn test_key_value_boundary_matters() {
        let a = BTreeMap::from([("ab".to_string(), "c".to_string())]);
        let b = BTreeMap::from([("a".to_string(), "bc".to_string())]);
        assert_ne!(hash_map(&a), hash_map(&b));
    }

    #[test]
    fn test_combine_order_sensitive() {
        assert_ne!(combine(["a", "b"]), combine(["b", "a"]));
    }
}
