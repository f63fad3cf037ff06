//! Root → issuer → license trust chain.
//!
//! A root key from the allowlist signs an `issuer_keyset.v1` document; the
//! issuer keys it lists then act as the keyring for license verification.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier};
use serde_json::Value;
use tracing::warn;

use crate::canonical::{canonical_json_bytes, signing_payload};
use crate::error::TrustChainError;
use crate::keyring::Keyring;

/// Issuer keyset schema.
pub const ISSUER_KEYSET_SCHEMA_VERSION: &str = "issuer_keyset.v1";

/// Root keyring plus a signed issuer keyset.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustChain {
    roots: Keyring,
    issuer_keyset: Value,
}

impl TrustChain {
    /// Create from the root allowlist and the raw keyset document.
    #[must_use]
    pub fn new(roots: Keyring, issuer_keyset: Value) -> Self {
        Self {
            roots,
            issuer_keyset,
        }
    }

    /// Verify the keyset against the roots and return the issuer keyring.
    pub fn issuer_keyring(&self) -> Result<Keyring, TrustChainError> {
        let keyset = self
            .issuer_keyset
            .as_object()
            .ok_or(TrustChainError::Invalid)?;
        if keyset.get("schema_version").and_then(Value::as_str) != Some(ISSUER_KEYSET_SCHEMA_VERSION) {
            return Err(TrustChainError::Invalid);
        }
        let root_kid = keyset
            .get("root_kid")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(TrustChainError::Invalid)?;
        let keys = keyset.get("keys").ok_or(TrustChainError::Invalid)?;
        if !keys.is_object() {
            return Err(TrustChainError::Invalid);
        }
        let signature = keyset
            .get("signature")
            .and_then(Value::as_str)
            .and_then(decode_signature)
            .ok_or(TrustChainError::SignatureInvalid)?;

        let root = self
            .roots
            .get(root_kid)
            .ok_or(TrustChainError::UnknownRootKid)?;
        let message = canonical_json_bytes(&signing_payload(&self.issuer_keyset));
        if root.verify(&message, &signature).is_err() {
            warn!(root_kid, "issuer keyset signature rejected");
            return Err(TrustChainError::SignatureInvalid);
        }

        Keyring::from_value(keys).map_err(|_| TrustChainError::Invalid)
    }
}

/// Decode a base64 64-byte Ed25519 signature.
pub(crate) fn decode_signature(encoded: &str) -> Option<Signature> {
    let raw = STANDARD.decode(encoded.trim()).ok()?;
    let bytes: [u8; 64] = raw.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}
