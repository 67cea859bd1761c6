//! Request fingerprints.
//!
//! A fingerprint is a stable hex digest of the canonical form of a
//! structured request descriptor. Canonicalization is structural, not
//! textual: mapping keys are hashed in sorted order, sequences are
//! hashed as unordered sets, and every node carries a type tag with a
//! `\x00` separator so differently-shaped values can never collide on
//! their serialized text.
//!
//! Two descriptor rules are baked in:
//! - `connection.options` is removed before hashing, so transport tuning
//!   (timeouts, parameter serialization) never affects cache identity;
//! - a process-scoped salt is mixed in under a reserved tag, namespacing
//!   caches per deployment.

use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::config::IdHashAlgorithm;

const ROOT_TAG: &[u8] = b"cprxy.id.v1\x00";

pub struct KeyHasher {
    algorithm: IdHashAlgorithm,
    salt: String,
}

impl KeyHasher {
    pub fn new(algorithm: IdHashAlgorithm, salt: impl Into<String>) -> Self {
        Self {
            algorithm,
            salt: salt.into(),
        }
    }

    /// Hex fingerprint of a descriptor.
    pub fn fingerprint(&self, value: &Value) -> String {
        let node = self.node_digest_stripped(value, true);
        let mut parts = Vec::with_capacity(ROOT_TAG.len() + self.salt.len() + 1 + node.len());
        parts.extend_from_slice(ROOT_TAG);
        parts.extend_from_slice(self.salt.as_bytes());
        parts.push(0);
        parts.extend_from_slice(&node);
        hex::encode(self.digest(&parts))
    }

    /// Digest a node, dropping `connection.options` at the top two levels
    /// (`{connection: {...}}` or the connection object itself).
    fn node_digest_stripped(&self, value: &Value, at_root: bool) -> Vec<u8> {
        match value {
            Value::Null => self.digest(b"null\x00"),
            Value::Bool(b) => {
                let tag: &[u8] = if *b { b"bool\x001" } else { b"bool\x000" };
                self.digest(tag)
            }
            Value::Number(n) => {
                let mut bytes = b"num\x00".to_vec();
                bytes.extend_from_slice(n.to_string().as_bytes());
                self.digest(&bytes)
            }
            Value::String(s) => {
                let mut bytes = b"str\x00".to_vec();
                bytes.extend_from_slice(s.as_bytes());
                self.digest(&bytes)
            }
            Value::Array(items) => {
                // Sequences are sets: element digests sorted before combining.
                let mut digests: Vec<Vec<u8>> = items
                    .iter()
                    .map(|item| self.node_digest_stripped(item, false))
                    .collect();
                digests.sort();
                let mut bytes = b"seq\x00".to_vec();
                for digest in digests {
                    bytes.extend_from_slice(&digest);
                }
                self.digest(&bytes)
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut bytes = b"map\x00".to_vec();
                for key in keys {
                    if at_root && key == "connection" {
                        if let Some(connection) = map.get(key) {
                            bytes.extend_from_slice(b"key\x00connection\x00");
                            bytes.extend_from_slice(&self.connection_digest(connection));
                            continue;
                        }
                    }
                    bytes.extend_from_slice(b"key\x00");
                    bytes.extend_from_slice(key.as_bytes());
                    bytes.push(0);
                    bytes.extend_from_slice(&self.node_digest_stripped(&map[key], false));
                }
                self.digest(&bytes)
            }
        }
    }

    fn connection_digest(&self, connection: &Value) -> Vec<u8> {
        match connection {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut bytes = b"map\x00".to_vec();
                for key in keys {
                    if key == "options" {
                        continue;
                    }
                    bytes.extend_from_slice(b"key\x00");
                    bytes.extend_from_slice(key.as_bytes());
                    bytes.push(0);
                    bytes.extend_from_slice(&self.node_digest_stripped(&map[key], false));
                }
                self.digest(&bytes)
            }
            other => self.node_digest_stripped(other, false),
        }
    }

    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self.algorithm {
            IdHashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            IdHashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hasher() -> KeyHasher {
        KeyHasher::new(IdHashAlgorithm::Sha256, "test-salt")
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"connection": {"host": "example.com", "path": "/v1"}, "data": {"a": 1, "b": 2}});
        let b = json!({"data": {"b": 2, "a": 1}, "connection": {"path": "/v1", "host": "example.com"}});
        assert_eq!(hasher().fingerprint(&a), hasher().fingerprint(&b));
    }

    #[test]
    fn sequences_are_unordered() {
        let a = json!({"data": {"ids": [3, 1, 2]}});
        let b = json!({"data": {"ids": [1, 2, 3]}});
        assert_eq!(hasher().fingerprint(&a), hasher().fingerprint(&b));
    }

    #[test]
    fn nested_structures_canonicalize_recursively() {
        let a = json!({"data": {"filters": [{"field": "name", "op": "eq"}, {"op": "gt", "field": "age"}]}});
        let b = json!({"data": {"filters": [{"field": "age", "op": "gt"}, {"op": "eq", "field": "name"}]}});
        assert_eq!(hasher().fingerprint(&a), hasher().fingerprint(&b));

        let c = json!({"data": {"filters": [{"field": "age", "op": "lt"}, {"op": "eq", "field": "name"}]}});
        assert_ne!(hasher().fingerprint(&a), hasher().fingerprint(&c));
    }

    #[test]
    fn leaf_changes_change_the_fingerprint() {
        let a = json!({"data": {"q": "games"}});
        let b = json!({"data": {"q": "games!"}});
        assert_ne!(hasher().fingerprint(&a), hasher().fingerprint(&b));
    }

    #[test]
    fn connection_options_are_excluded() {
        let a = json!({"connection": {"host": "example.com", "options": {"timeout_ms": 100}}});
        let b = json!({"connection": {"host": "example.com", "options": {"timeout_ms": 9000}}});
        let c = json!({"connection": {"host": "example.com"}});
        let hasher = hasher();
        assert_eq!(hasher.fingerprint(&a), hasher.fingerprint(&b));
        assert_eq!(hasher.fingerprint(&a), hasher.fingerprint(&c));
    }

    #[test]
    fn options_elsewhere_still_count() {
        // Only connection.options is transport tuning; an "options" field
        // in user data is identity.
        let a = json!({"data": {"options": 1}});
        let b = json!({"data": {"options": 2}});
        assert_ne!(hasher().fingerprint(&a), hasher().fingerprint(&b));
    }

    #[test]
    fn salt_namespaces_fingerprints() {
        let value = json!({"data": {"q": "games"}});
        let a = KeyHasher::new(IdHashAlgorithm::Sha256, "deploy-a").fingerprint(&value);
        let b = KeyHasher::new(IdHashAlgorithm::Sha256, "deploy-b").fingerprint(&value);
        assert_ne!(a, b);
    }

    #[test]
    fn type_tags_prevent_cross_type_collisions() {
        let hasher = hasher();
        assert_ne!(
            hasher.fingerprint(&json!("1")),
            hasher.fingerprint(&json!(1))
        );
        assert_ne!(
            hasher.fingerprint(&json!(null)),
            hasher.fingerprint(&json!("null"))
        );
    }

    #[test]
    fn sha512_produces_longer_output() {
        let value = json!({"a": 1});
        let short = KeyHasher::new(IdHashAlgorithm::Sha256, "").fingerprint(&value);
        let long = KeyHasher::new(IdHashAlgorithm::Sha512, "").fingerprint(&value);
        assert_eq!(short.len(), 64);
        assert_eq!(long.len(), 128);
    }
}
