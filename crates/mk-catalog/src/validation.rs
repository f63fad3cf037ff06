//! Catalog validation.
//!
//! Validation walks the raw JSON rather than the typed structs so every
//! problem in a file is reported at once, with the path of the offending
//! field. Loading refuses the whole catalog if any message is produced.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chord::is_safe_chord_id;

/// Catalog schema accepted by this crate.
pub const CATALOG_SCHEMA_VERSION: &str = "chord_catalog.v1";

/// Schema of [`ValidationReport`].
pub const VALIDATE_SCHEMA_VERSION: &str = "chords_validate.v0";

const REQUIRED_CHORD_KEYS: [&str; 6] = [
    "id",
    "intent",
    "risk_tier",
    "required_signals",
    "invariants",
    "knobs_touched",
];
const OPTIONAL_CHORD_KEYS: [&str; 2] = ["cooldown_ms", "budget"];

/// Machine-readable validation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Always `chords_validate.v0`.
    pub schema_version: String,
    /// No errors.
    pub ok: bool,
    /// One message per problem, in document order.
    pub errors: Vec<String>,
    /// Length of the `chords` array, if there is one.
    pub chord_count: usize,
    /// Sorted distinct string ids.
    pub chord_ids: Vec<String>,
}

/// Validates catalog documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogValidator;

impl CatalogValidator {
    /// Create a validator.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate catalog text. `source` prefixes every message.
    #[must_use]
    pub fn validate_str(&self, text: &str, source: &str) -> ValidationReport {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.validate_value(&value, source),
            Err(err) => ValidationReport {
                schema_version: VALIDATE_SCHEMA_VERSION.to_string(),
                ok: false,
                errors: vec![format!("{source}: invalid JSON: {err}")],
                chord_count: 0,
                chord_ids: Vec::new(),
            },
        }
    }

    /// Validate a parsed catalog document.
    #[must_use]
    pub fn validate_value(&self, catalog: &Value, source: &str) -> ValidationReport {
        let errors = Self::errors(catalog, source);
        let (chord_count, chord_ids) = match catalog.get("chords").and_then(Value::as_array) {
            Some(chords) => (
                chords.len(),
                chords
                    .iter()
                    .filter_map(|c| c.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
            ),
            None => (0, Vec::new()),
        };
        ValidationReport {
            schema_version: VALIDATE_SCHEMA_VERSION.to_string(),
            ok: errors.is_empty(),
            errors,
            chord_count,
            chord_ids,
        }
    }

    /// All problems in a catalog document.
    #[must_use]
    pub fn errors(catalog: &Value, source: &str) -> Vec<String> {
        let Some(top) = catalog.as_object() else {
            return vec![format!("{source}: top-level JSON must be an object")];
        };
        let mut errors = Vec::new();

        let mut unknown: Vec<&String> = top
            .keys()
            .filter(|k| !matches!(k.as_str(), "schema_version" | "chords"))
            .collect();
        unknown.sort();
        for key in unknown {
            errors.push(format!("{source}: unknown top-level field '{key}'"));
        }

        if top.get("schema_version").and_then(Value::as_str) != Some(CATALOG_SCHEMA_VERSION) {
            errors.push(format!(
                "{source}: schema_version must be '{CATALOG_SCHEMA_VERSION}'"
            ));
        }

        let Some(chords) = top.get("chords").and_then(Value::as_array) else {
            errors.push(format!("{source}: chords must be an array"));
            return errors;
        };

        let mut seen = BTreeSet::new();
        for (index, item) in chords.iter().enumerate() {
            let path = format!("{source}: chords[{index}]");
            let Some(chord) = item.as_object() else {
                errors.push(format!("{path} must be an object"));
                continue;
            };

            let mut unknown: Vec<&String> = chord
                .keys()
                .filter(|k| {
                    !REQUIRED_CHORD_KEYS.contains(&k.as_str())
                        && !OPTIONAL_CHORD_KEYS.contains(&k.as_str())
                })
                .collect();
            unknown.sort();
            for key in unknown {
                errors.push(format!("{path}: unknown field '{key}'"));
            }
            for key in REQUIRED_CHORD_KEYS {
                if !chord.contains_key(key) {
                    errors.push(format!("{path}: missing required field '{key}'"));
                }
            }

            let id = chord.get("id").and_then(Value::as_str);
            match id {
                Some("") => errors.push(format!("{path}: id must not be empty")),
                Some(id) if !seen.insert(id.to_string()) => {
                    errors.push(format!("{path}: duplicate chord id '{id}'"));
                }
                Some(_) => {}
                None => errors.push(format!("{path}: id must be string")),
            }

            if !chord.get("intent").is_some_and(Value::is_string) {
                errors.push(format!("{path}: intent must be string"));
            }

            match chord.get("risk_tier").and_then(Value::as_str) {
                Some("safe") => {
                    if let Some(id) = id.filter(|id| !is_safe_chord_id(id)) {
                        errors.push(format!(
                            "{path}: risk_tier 'safe' is reserved for the v1 safe set, '{id}' must be 'advanced'"
                        ));
                    }
                }
                Some("advanced") => {}
                Some(other) => errors.push(format!(
                    "{path}: risk_tier must be 'safe' or 'advanced', got '{other}'"
                )),
                None => errors.push(format!("{path}: risk_tier must be string")),
            }

            if string_list(chord.get("required_signals")).is_none() {
                errors.push(format!("{path}: required_signals must be array of strings"));
            }
            for key in ["invariants", "knobs_touched"] {
                match string_list(chord.get(key)) {
                    None => errors.push(format!("{path}: {key} must be array of strings")),
                    Some(0) => errors.push(format!("{path}: {key} must not be empty")),
                    Some(_) => {}
                }
            }

            if chord.contains_key("cooldown_ms") && !chord.get("cooldown_ms").is_some_and(Value::is_u64) {
                errors.push(format!("{path}: cooldown_ms must be int"));
            }
            if chord.contains_key("budget") && !chord.get("budget").is_some_and(Value::is_object) {
                errors.push(format!("{path}: budget must be object"));
            }
        }

        errors
    }
}

/// Length of a list of strings, or `None` if it is not one.
fn string_list(value: Option<&Value>) -> Option<usize> {
    let items = value?.as_array()?;
    items.iter().all(Value::is_string).then_some(items.len())
}
