//! ModeKeeper License Verification
//!
//! Offline entitlement checks for `license.v1` documents.
//!
//! # Overview
//!
//! - **canonical**: sorted-key compact JSON, the bytes that get signed
//! - **[`Keyring`]**: `kid -> Ed25519 public key` allowlist
//! - **[`LicenseVerifier`]**: document checks with a closed [`LicenseReason`]
//! - **[`TrustChain`]**: root-signed issuer keysets as an alternate key source
//!
//! A document naming a `kid` is verified by that key only. An unknown kid is
//! `license_invalid` even if another stored key would accept the signature.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod canonical;
pub mod error;
pub mod keyring;
pub mod trust_chain;
pub mod verifier;

pub use canonical::{canonical_json_bytes, sign_document, signing_payload};
pub use error::{KeyringError, TrustChainError};
pub use keyring::{decode_public_key, encode_public_key, Keyring};
pub use trust_chain::{TrustChain, ISSUER_KEYSET_SCHEMA_VERSION};
pub use verifier::{
    BindingContext, LicenseReason, LicenseVerification, LicenseVerifier, TrustMode,
    VerifierOptions, LICENSE_SCHEMA_VERSION, LICENSE_VERIFY_SCHEMA_VERSION,
};
