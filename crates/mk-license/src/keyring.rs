//! Allowlisted Ed25519 public keys, keyed by `kid`.

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::KeyringError;

/// `kid -> public key`, iterated in kid order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyring {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Keyring {
    /// Empty keyring.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key.
    pub fn insert(&mut self, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(kid.into(), key);
    }

    /// Builder form of [`Keyring::insert`].
    #[must_use]
    pub fn with_key(mut self, kid: impl Into<String>, key: VerifyingKey) -> Self {
        self.insert(kid, key);
        self
    }

    /// Parse `{kid: base64(raw 32-byte key)}`.
    ///
    /// Entries with an empty kid or an undecodable key are skipped.
    pub fn from_json_str(text: &str) -> Result<Self, KeyringError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Parse an already decoded keyring object.
    pub fn from_value(value: &Value) -> Result<Self, KeyringError> {
        let map = value.as_object().ok_or(KeyringError::NotAnObject)?;
        let mut keyring = Self::new();
        for (kid, encoded) in map {
            let kid = kid.trim();
            if kid.is_empty() {
                warn!("public key with empty kid skipped");
                continue;
            }
            match encoded.as_str().and_then(decode_public_key) {
                Some(key) => keyring.insert(kid, key),
                None => warn!(kid, "malformed public key skipped"),
            }
        }
        debug!(keys = keyring.len(), "keyring loaded");
        Ok(keyring)
    }

    /// Read a keyring file.
    pub fn load_file(path: &Path) -> Result<Self, KeyringError> {
        let text = std::fs::read_to_string(path).map_err(|source| KeyringError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Key for a kid.
    #[inline]
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(kid)
    }

    /// Keys in kid order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VerifyingKey)> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether there are no keys.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Decode a base64 raw 32-byte Ed25519 public key.
#[must_use]
pub fn decode_public_key(encoded: &str) -> Option<VerifyingKey> {
    let raw = STANDARD.decode(encoded.trim()).ok()?;
    let bytes: [u8; 32] = raw.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Encode a public key the way keyrings store it.
#[must_use]
pub fn encode_public_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    #[test]
    fn test_malformed_entries_skipped() {
        let good = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        let doc = json!({
            "k1": encode_public_key(&good),
            "short": STANDARD.encode([1u8; 16]),
            "not-b64": "***",
            "number": 5,
            " ": encode_public_key(&good),
        });
        let keyring = Keyring::from_value(&doc).unwrap();
        assert_eq!(keyring.len(), 1);
        assert_eq!(keyring.get("k1"), Some(&good));
    }

    #[test]
    fn test_non_object_is_fatal() {
        assert!(matches!(Keyring::from_json_str("[1]"), Err(KeyringError::NotAnObject)));
        assert!(matches!(Keyring::from_json_str("{"), Err(KeyringError::Json(_))));
    }
}
