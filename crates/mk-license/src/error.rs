//! License subsystem errors.
//!
//! Verification outcomes are not errors: they are [`crate::LicenseReason`]
//! values. Only an unusable keyring is fatal.

use std::path::PathBuf;

use thiserror::Error;

/// Keyring could not be loaded.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// The keyring file could not be read.
    #[error("cannot read public keys {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The keyring is not valid JSON.
    #[error("public keys are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The keyring JSON is not an object of `kid -> key`.
    #[error("public keys must be a JSON object mapping kid to base64 key")]
    NotAnObject,
}

/// Issuer keyset rejected in trust-chain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrustChainError {
    /// Shape or schema problem in the keyset.
    #[error("issuer keyset is malformed")]
    Invalid,

    /// `root_kid` is not in the root keyring.
    #[error("issuer keyset names an unknown root kid")]
    UnknownRootKid,

    /// Root signature over the keyset does not verify.
    #[error("issuer keyset signature does not verify")]
    SignatureInvalid,
}

impl TrustChainError {
    /// Stable detail code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TrustChainError::Invalid => "issuer_keyset_invalid",
            TrustChainError::UnknownRootKid => "issuer_keyset_unknown_root_kid",
            TrustChainError::SignatureInvalid => "issuer_keyset_signature_invalid",
        }
    }
}
