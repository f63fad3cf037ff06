//! Canonical JSON for signed documents.
//!
//! Object keys are sorted, no whitespace is emitted and non-ASCII text is
//! written as UTF-8. Signers and verifiers must agree on these bytes exactly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::Value;

/// Serialize a JSON value to canonical bytes.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars serialize infallibly into a Vec.
    if let Ok(bytes) = serde_json::to_vec(value) {
        out.extend_from_slice(&bytes);
    }
}

/// Copy of a document object with its `signature` field removed.
#[must_use]
pub fn signing_payload(document: &Value) -> Value {
    let mut payload = document.clone();
    if let Value::Object(map) = &mut payload {
        map.remove("signature");
    }
    payload
}

/// Sign a document's canonical payload and return the base64 signature.
///
/// Used by issuing tooling and fixtures; verification never signs.
#[must_use]
pub fn sign_document(document: &Value, signing_key: &SigningKey) -> String {
    let message = canonical_json_bytes(&signing_payload(document));
    STANDARD.encode(signing_key.sign(&message).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_compact() {
        let value = json!({"b": 1, "a": {"z": [1, 2, {"y": "x", "c": null}], "m": true}});
        assert_eq!(
            String::from_utf8(canonical_json_bytes(&value)).unwrap(),
            r#"{"a":{"m":true,"z":[1,2,{"c":null,"y":"x"}]},"b":1}"#
        );
    }

    #[test]
    fn test_unicode_is_not_escaped() {
        let value = json!({"org": "Zürich \"Labs\""});
        assert_eq!(
            String::from_utf8(canonical_json_bytes(&value)).unwrap(),
            "{\"org\":\"Zürich \\\"Labs\\\"\"}"
        );
    }

    #[test]
    fn test_signature_excluded_from_payload() {
        let doc = json!({"org": "Acme", "signature": "abc"});
        assert_eq!(signing_payload(&doc), json!({"org": "Acme"}));
    }
}
