//! Offline `license.v1` verification.
//!
//! Every outcome is a [`LicenseVerification`] carrying a closed reason code.
//! The verifier never fails with an error: an unreadable or malformed
//! document is simply `license_invalid`.

use std::collections::BTreeSet;
use std::fmt;

use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::canonical::{canonical_json_bytes, signing_payload};
use crate::keyring::Keyring;
use crate::trust_chain::{decode_signature, TrustChain};

/// License schema accepted by the verifier.
pub const LICENSE_SCHEMA_VERSION: &str = "license.v1";

/// Schema of the serialized [`LicenseVerification`].
pub const LICENSE_VERIFY_SCHEMA_VERSION: &str = "license_verify.v0";

/// Closed vocabulary of verification outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseReason {
    /// Valid and entitled.
    Ok,
    /// No document could be resolved.
    LicenseMissing,
    /// Malformed, unsigned, wrongly signed or unknown kid.
    LicenseInvalid,
    /// Current time is at or past `expires_at`.
    LicenseExpired,
    /// The required entitlement is absent.
    EntitlementMissing,
    /// An environment binding does not match.
    BindingMismatch,
}

impl LicenseReason {
    /// Wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LicenseReason::Ok => "ok",
            LicenseReason::LicenseMissing => "license_missing",
            LicenseReason::LicenseInvalid => "license_invalid",
            LicenseReason::LicenseExpired => "license_expired",
            LicenseReason::EntitlementMissing => "entitlement_missing",
            LicenseReason::BindingMismatch => "binding_mismatch",
        }
    }
}

impl fmt::Display for LicenseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of verifying one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseVerification {
    /// Always `license_verify.v0`.
    pub schema_version: String,
    /// `reason == ok`.
    pub ok: bool,
    /// Outcome code.
    pub reason: LicenseReason,
    /// Kid that verified the signature, or the one the document named.
    pub kid: Option<String>,
    /// Licensing organization, once parsed.
    pub org: Option<String>,
    /// Expiry, epoch seconds, when parseable.
    pub expires_at: Option<i64>,
    /// Trimmed, de-duplicated, sorted entitlements.
    pub entitlements: Vec<String>,
    /// Finer code behind a `license_invalid`, e.g. `unknown_kid`.
    pub detail: Option<String>,
}

impl LicenseVerification {
    fn new(reason: LicenseReason) -> Self {
        Self {
            schema_version: LICENSE_VERIFY_SCHEMA_VERSION.to_string(),
            ok: reason == LicenseReason::Ok,
            reason,
            kid: None,
            org: None,
            expires_at: None,
            entitlements: Vec::new(),
            detail: None,
        }
    }

    /// Outcome for "no document".
    #[must_use]
    pub fn missing() -> Self {
        Self::new(LicenseReason::LicenseMissing)
    }

    fn with_reason(mut self, reason: LicenseReason) -> Self {
        self.ok = reason == LicenseReason::Ok;
        self.reason = reason;
        self
    }
}

/// Environment facts a license may be bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingContext {
    /// Current Kubernetes context, if it could be determined.
    pub kube_context: Option<String>,
}

impl BindingContext {
    /// Context with a known kube context.
    #[must_use]
    pub fn with_kube_context(mut self, context: impl Into<String>) -> Self {
        self.kube_context = Some(context.into());
        self
    }
}

/// Where verifying keys come from.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustMode {
    /// Keys come straight from an allowlist.
    Direct(Keyring),
    /// Keys come from a root-signed issuer keyset.
    Chain(TrustChain),
}

/// Verification options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierOptions {
    /// Accept documents without `kid` by trying every key in kid order.
    pub allow_kidless_scan: bool,
}

/// Verifies `license.v1` documents.
#[derive(Debug, Clone)]
pub struct LicenseVerifier {
    trust: TrustMode,
    options: VerifierOptions,
}

impl LicenseVerifier {
    /// Verifier over a direct keyring.
    #[must_use]
    pub fn new(keyring: Keyring) -> Self {
        Self {
            trust: TrustMode::Direct(keyring),
            options: VerifierOptions::default(),
        }
    }

    /// Verifier in trust-chain mode.
    #[must_use]
    pub fn with_trust_chain(chain: TrustChain) -> Self {
        Self {
            trust: TrustMode::Chain(chain),
            options: VerifierOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: VerifierOptions) -> Self {
        self.options = options;
        self
    }

    /// Key source in use.
    #[inline]
    #[must_use]
    pub fn trust(&self) -> &TrustMode {
        &self.trust
    }

    /// Verify raw document text. `None` means no document was found.
    ///
    /// `now` is epoch seconds.
    #[must_use]
    pub fn verify(
        &self,
        raw: Option<&str>,
        required_entitlement: &str,
        now: i64,
        binding: &BindingContext,
    ) -> LicenseVerification {
        let Some(raw) = raw else {
            debug!("no license document");
            return LicenseVerification::missing();
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(document) => self.verify_value(&document, required_entitlement, now, binding),
            Err(_) => LicenseVerification::new(LicenseReason::LicenseInvalid),
        }
    }

    /// Verify an already parsed document.
    #[must_use]
    pub fn verify_value(
        &self,
        document: &Value,
        required_entitlement: &str,
        now: i64,
        binding: &BindingContext,
    ) -> LicenseVerification {
        let result = self.check(document, required_entitlement, now, binding);
        if result.ok {
            info!(kid = ?result.kid, org = ?result.org, "license verified");
        } else {
            warn!(reason = %result.reason, kid = ?result.kid, detail = ?result.detail, "license rejected");
        }
        result
    }

    fn check(
        &self,
        document: &Value,
        required_entitlement: &str,
        now: i64,
        binding: &BindingContext,
    ) -> LicenseVerification {
        use LicenseReason::{EntitlementMissing, LicenseExpired, LicenseInvalid};

        let mut out = LicenseVerification::new(LicenseInvalid);
        let Some(doc) = document.as_object() else {
            return out;
        };
        let expires_at = epoch(doc.get("expires_at"));
        out.expires_at = expires_at;

        if doc.get("schema_version").and_then(Value::as_str) != Some(LICENSE_SCHEMA_VERSION) {
            return out;
        }
        let Some(org) = doc.get("org").and_then(Value::as_str).map(str::trim).filter(|o| !o.is_empty()) else {
            return out;
        };
        let (Some(issued_at), Some(expires_at)) = (epoch(doc.get("issued_at")), expires_at) else {
            return out;
        };
        let Some(entitlements) = entitlements(doc.get("entitlements")) else {
            return out;
        };
        let bindings = match doc.get("bindings") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => return out,
        };
        let kid = match doc.get("kid") {
            None | Some(Value::Null) => None,
            Some(Value::String(k)) if !k.trim().is_empty() => Some(k.trim().to_string()),
            Some(_) => return out,
        };
        let Some(signature) = doc.get("signature").and_then(Value::as_str).and_then(decode_signature) else {
            out.kid = kid;
            return out;
        };
        out.org = Some(org.to_string());
        out.entitlements = entitlements;
        out.kid.clone_from(&kid);

        let keyring = match &self.trust {
            TrustMode::Direct(keyring) => keyring.clone(),
            TrustMode::Chain(chain) => match chain.issuer_keyring() {
                Ok(keyring) => keyring,
                Err(err) => {
                    out.detail = Some(err.as_str().to_string());
                    return out;
                }
            },
        };

        let message = canonical_json_bytes(&signing_payload(document));
        let verifies = |key: &VerifyingKey| key.verify(&message, &signature).is_ok();
        match kid.as_deref() {
            Some(kid) => {
                // A named kid is the only key allowed to verify.
                match keyring.get(kid) {
                    Some(key) if verifies(key) => {}
                    Some(_) => return out,
                    None => {
                        out.detail = Some("unknown_kid".to_string());
                        return out;
                    }
                }
            }
            None if self.options.allow_kidless_scan => {
                match keyring.iter().find(|(_, key)| verifies(*key)) {
                    Some((found, _)) => out.kid = Some(found.to_string()),
                    None => return out,
                }
            }
            None => {
                out.detail = Some("kid_required".to_string());
                return out;
            }
        }

        if issued_at >= expires_at || now < issued_at {
            return out;
        }
        if now >= expires_at {
            return out.with_reason(LicenseExpired);
        }

        if let Some(bindings) = bindings {
            if let Some(reason) = check_bindings(bindings, binding) {
                return out.with_reason(reason);
            }
        }

        if !out.entitlements.iter().any(|e| e == required_entitlement) {
            return out.with_reason(EntitlementMissing);
        }
        out.with_reason(LicenseReason::Ok)
    }
}

/// `None` when every binding matches.
fn check_bindings(bindings: &Map<String, Value>, context: &BindingContext) -> Option<LicenseReason> {
    let expected = bindings.get("kube_context")?;
    let Some(expected) = expected.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
        return Some(LicenseReason::LicenseInvalid);
    };
    match context.kube_context.as_deref().map(str::trim) {
        Some(current) if current == expected => None,
        _ => Some(LicenseReason::BindingMismatch),
    }
}

/// Integer epoch seconds. Booleans and floats are rejected.
fn epoch(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn entitlements(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    let mut out = BTreeSet::new();
    for item in items {
        let text = item.as_str()?.trim();
        if !text.is_empty() {
            out.insert(text.to_string());
        }
    }
    Some(out.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sign_document;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    const NOW: i64 = 1_800_000_000;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn license(signer: &SigningKey, kid: Option<&str>) -> Value {
        let mut doc = json!({
            "schema_version": "license.v1",
            "org": "Acme",
            "issued_at": 1_700_000_000,
            "expires_at": 4_102_444_800_i64,
            "entitlements": ["observe", " apply ", "apply"],
        });
        if let Some(kid) = kid {
            doc["kid"] = json!(kid);
        }
        doc["signature"] = json!(sign_document(&doc, signer));
        doc
    }

    fn verifier() -> LicenseVerifier {
        LicenseVerifier::new(Keyring::new().with_key("k1", key(1).verifying_key()))
    }

    #[test]
    fn test_valid_license() {
        let result = verifier().verify_value(&license(&key(1), Some("k1")), "apply", NOW, &BindingContext::default());
        assert_eq!(result.reason, LicenseReason::Ok);
        assert!(result.ok);
        assert_eq!(result.entitlements, vec!["apply", "observe"]);
        assert_eq!(result.kid.as_deref(), Some("k1"));
        assert_eq!(result.expires_at, Some(4_102_444_800));
    }

    #[test]
    fn test_missing_document() {
        let result = verifier().verify(None, "apply", NOW, &BindingContext::default());
        assert_eq!(result.reason, LicenseReason::LicenseMissing);
    }

    #[test]
    fn test_tampered_payload() {
        let mut doc = license(&key(1), Some("k1"));
        doc["entitlements"] = json!(["apply", "everything"]);
        let result = verifier().verify_value(&doc, "apply", NOW, &BindingContext::default());
        assert_eq!(result.reason, LicenseReason::LicenseInvalid);
    }

    #[test]
    fn test_expiry_boundary() {
        let doc = license(&key(1), Some("k1"));
        let at_expiry = verifier().verify_value(&doc, "apply", 4_102_444_800, &BindingContext::default());
        assert_eq!(at_expiry.reason, LicenseReason::LicenseExpired);
        let before_issue = verifier().verify_value(&doc, "apply", 1_600_000_000, &BindingContext::default());
        assert_eq!(before_issue.reason, LicenseReason::LicenseInvalid);
    }

    #[test]
    fn test_entitlement_missing() {
        let result = verifier().verify_value(&license(&key(1), Some("k1")), "fleet", NOW, &BindingContext::default());
        assert_eq!(result.reason, LicenseReason::EntitlementMissing);
    }

    #[test]
    fn test_kidless_requires_opt_in() {
        let doc = license(&key(1), None);
        let strict = verifier().verify_value(&doc, "apply", NOW, &BindingContext::default());
        assert_eq!(strict.reason, LicenseReason::LicenseInvalid);
        assert_eq!(strict.detail.as_deref(), Some("kid_required"));

        let scanning = verifier()
            .with_options(VerifierOptions { allow_kidless_scan: true })
            .verify_value(&doc, "apply", NOW, &BindingContext::default());
        assert_eq!(scanning.reason, LicenseReason::Ok);
        assert_eq!(scanning.kid.as_deref(), Some("k1"));
    }

    #[test]
    fn test_kube_context_binding() {
        let mut doc = license(&key(1), Some("k1"));
        doc.as_object_mut().unwrap().remove("signature");
        doc["bindings"] = json!({"kube_context": "prod"});
        doc["signature"] = json!(sign_document(&doc, &key(1)));

        let v = verifier();
        let matching = BindingContext::default().with_kube_context("prod");
        assert_eq!(v.verify_value(&doc, "apply", NOW, &matching).reason, LicenseReason::Ok);
        let other = BindingContext::default().with_kube_context("staging");
        assert_eq!(v.verify_value(&doc, "apply", NOW, &other).reason, LicenseReason::BindingMismatch);
        assert_eq!(
            v.verify_value(&doc, "apply", NOW, &BindingContext::default()).reason,
            LicenseReason::BindingMismatch
        );
    }

    #[test]
    fn test_kube_context_binding_ignores_surrounding_whitespace() {
        let mut doc = license(&key(1), Some("k1"));
        doc.as_object_mut().unwrap().remove("signature");
        doc["bindings"] = json!({"kube_context": " prod "});
        doc["signature"] = json!(sign_document(&doc, &key(1)));

        let v = verifier();
        let padded = BindingContext::default().with_kube_context("prod\n");
        assert_eq!(v.verify_value(&doc, "apply", NOW, &padded).reason, LicenseReason::Ok);
        let blank = BindingContext::default().with_kube_context("  ");
        assert_eq!(v.verify_value(&doc, "apply", NOW, &blank).reason, LicenseReason::BindingMismatch);
    }

    #[test]
    fn test_boolean_epoch_rejected() {
        let mut doc = license(&key(1), Some("k1"));
        doc["issued_at"] = json!(true);
        let result = verifier().verify_value(&doc, "apply", NOW, &BindingContext::default());
        assert_eq!(result.reason, LicenseReason::LicenseInvalid);
    }
}
