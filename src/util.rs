//! Shared helpers: canonical JSON encoding, content hashing, env parsing.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` with the canonical JSON codec used throughout the
/// cache stack. Field order need not match any external format — only
/// byte-equality of repeated calls on the same value matters, which
/// `serde_json` already guarantees (struct fields serialize in
/// declaration order).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of the canonical JSON serialization of `value`.
/// Used for the collection `{key}-latest` content pointer.
pub fn hash_value<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json(value)?))
}

/// Whether `key` is a "collection" key that the hash-indexed cache should
/// index (suffix `-feature-configs` or `-segments`).
pub fn is_collection_key(key: &str) -> bool {
    key.ends_with("-feature-configs") || key.ends_with("-segments")
}

/// The companion `{key}-latest` pointer key for a collection key.
pub fn latest_key(key: &str) -> String {
    format!("{key}-latest")
}

/// Parse an environment variable as a boolean, returning `default` if unset
/// or unparseable.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Example {
        a: u32,
        b: String,
    }

    #[test]
    fn hash_value_is_deterministic() {
        let v = Example {
            a: 1,
            b: "x".to_string(),
        };
        let h1 = hash_value(&v).unwrap();
        let h2 = hash_value(&v).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn hash_value_changes_with_content() {
        let v1 = Example {
            a: 1,
            b: "x".to_string(),
        };
        let v2 = Example {
            a: 2,
            b: "x".to_string(),
        };
        assert_ne!(hash_value(&v1).unwrap(), hash_value(&v2).unwrap());
    }

    #[test]
    fn collection_key_detection() {
        assert!(is_collection_key("env-123-feature-configs"));
        assert!(is_collection_key("env-123-segments"));
        assert!(!is_collection_key("env-123-feature-config-abc"));
        assert!(!is_collection_key("env-123-segment-abc"));
    }

    #[test]
    fn latest_key_shape() {
        assert_eq!(latest_key("env-123-segments"), "env-123-segments-latest");
    }
}
