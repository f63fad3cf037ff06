use std::io::Write;

use ed25519_dalek::SigningKey;
use mk_license::{
    encode_public_key, sign_document, BindingContext, Keyring, LicenseReason, LicenseVerifier,
    TrustChain, ISSUER_KEYSET_SCHEMA_VERSION,
};
use proptest::prelude::*;
use serde_json::{json, Value};

const NOW: i64 = 1_800_000_000;

fn signed(signer: &SigningKey, kid: &str) -> Value {
    let mut doc = json!({
        "schema_version": "license.v1",
        "org": "Acme",
        "kid": kid,
        "issued_at": 1_700_000_000,
        "expires_at": 4_102_444_800_i64,
        "entitlements": ["apply"],
    });
    doc["signature"] = json!(sign_document(&doc, signer));
    doc
}

#[test]
fn test_unknown_kid_is_invalid_even_if_another_key_verifies() {
    let signer = SigningKey::from_bytes(&[5u8; 32]);
    // The stored key would accept the signature, but under a different kid.
    let keyring = Keyring::new().with_key("known", signer.verifying_key());
    let doc = signed(&signer, "rotated-away");

    let result = LicenseVerifier::new(keyring).verify_value(&doc, "apply", NOW, &BindingContext::default());
    assert_eq!(result.reason, LicenseReason::LicenseInvalid);
    assert!(!result.ok);
    assert_eq!(result.detail.as_deref(), Some("unknown_kid"));
}

#[test]
fn test_named_kid_with_wrong_key_is_invalid() {
    let signer = SigningKey::from_bytes(&[5u8; 32]);
    let other = SigningKey::from_bytes(&[6u8; 32]);
    let keyring = Keyring::new()
        .with_key("a", other.verifying_key())
        .with_key("b", signer.verifying_key());
    let doc = signed(&signer, "a");
    let result = LicenseVerifier::new(keyring).verify_value(&doc, "apply", NOW, &BindingContext::default());
    assert_eq!(result.reason, LicenseReason::LicenseInvalid);
}

#[test]
fn test_keyring_file_and_raw_text() {
    let signer = SigningKey::from_bytes(&[9u8; 32]);
    let mut keys = tempfile::NamedTempFile::new().unwrap();
    write!(keys, "{}", json!({"k9": encode_public_key(&signer.verifying_key())})).unwrap();

    let keyring = Keyring::load_file(keys.path()).unwrap();
    let raw = serde_json::to_string_pretty(&signed(&signer, "k9")).unwrap();
    let result = LicenseVerifier::new(keyring).verify(Some(&raw), "apply", NOW, &BindingContext::default());
    assert_eq!(result.reason, LicenseReason::Ok);
}

#[test]
fn test_trust_chain_verifier() {
    let root = SigningKey::from_bytes(&[11u8; 32]);
    let issuer = SigningKey::from_bytes(&[22u8; 32]);
    let mut keyset = json!({
        "schema_version": ISSUER_KEYSET_SCHEMA_VERSION,
        "root_kid": "root-2026-01",
        "keys": {"issuer-2026-02": encode_public_key(&issuer.verifying_key())},
    });
    keyset["signature"] = json!(sign_document(&keyset, &root));
    let roots = Keyring::new().with_key("root-2026-01", root.verifying_key());
    let verifier = LicenseVerifier::with_trust_chain(TrustChain::new(roots, keyset.clone()));

    let ok = verifier.verify_value(&signed(&issuer, "issuer-2026-02"), "apply", NOW, &BindingContext::default());
    assert_eq!(ok.reason, LicenseReason::Ok);
    assert_eq!(ok.kid.as_deref(), Some("issuer-2026-02"));

    keyset["root_kid"] = json!("root-unknown");
    let broken = LicenseVerifier::with_trust_chain(TrustChain::new(
        Keyring::new().with_key("root-2026-01", root.verifying_key()),
        keyset,
    ));
    let result = broken.verify_value(&signed(&issuer, "issuer-2026-02"), "apply", NOW, &BindingContext::default());
    assert_eq!(result.reason, LicenseReason::LicenseInvalid);
    assert_eq!(result.detail.as_deref(), Some("issuer_keyset_unknown_root_kid"));
}

#[test]
fn test_garbage_text_is_invalid_not_missing() {
    let verifier = LicenseVerifier::new(Keyring::new());
    let result = verifier.verify(Some("not json"), "apply", NOW, &BindingContext::default());
    assert_eq!(result.reason, LicenseReason::LicenseInvalid);
}

proptest! {
    #[test]
    fn prop_kid_strictness(seed_a in 1u8..=255, seed_b in 1u8..=255, kid in "[a-z]{1,8}") {
        prop_assume!(seed_a != seed_b);
        let stored = SigningKey::from_bytes(&[seed_a; 32]);
        let signer = SigningKey::from_bytes(&[seed_b; 32]);
        let keyring = Keyring::new()
            .with_key("stored", stored.verifying_key())
            .with_key("signer-under-other-name", signer.verifying_key());
        prop_assume!(kid != "stored");
        let doc = signed(&signer, &kid);
        let result = LicenseVerifier::new(keyring).verify_value(&doc, "apply", NOW, &BindingContext::default());
        prop_assert_eq!(result.reason, LicenseReason::LicenseInvalid);
    }
}
