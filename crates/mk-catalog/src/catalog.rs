//! Loaded chord catalog.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::chord::{ChordDefinition, RiskTier};
use crate::error::CatalogError;
use crate::validation::CatalogValidator;

const BUILTIN_V1: &str = include_str!("../catalog/chord_catalog.v1.json");

#[derive(Deserialize)]
struct CatalogFile {
    schema_version: String,
    chords: Vec<ChordDefinition>,
}

/// Validated, immutable table of chords in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChordCatalog {
    schema_version: String,
    chords: Vec<ChordDefinition>,
    index: BTreeMap<String, usize>,
}

impl ChordCatalog {
    /// The catalog shipped with this crate.
    pub fn builtin_v1() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_V1, "builtin:chord_catalog.v1")
    }

    /// Source text of the builtin catalog.
    #[inline]
    #[must_use]
    pub fn builtin_v1_text() -> &'static str {
        BUILTIN_V1
    }

    /// Parse and validate catalog JSON. Any problem rejects the whole catalog.
    pub fn from_json(text: &str, source: &str) -> Result<Self, CatalogError> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                return Err(CatalogError::Invalid {
                    errors: vec![format!("{source}: invalid JSON: {err}")],
                })
            }
        };
        Self::from_value(value, source)
    }

    /// Validate a parsed document and build the catalog.
    pub fn from_value(value: Value, source: &str) -> Result<Self, CatalogError> {
        let errors = CatalogValidator::errors(&value, source);
        if !errors.is_empty() {
            return Err(CatalogError::Invalid { errors });
        }
        let file: CatalogFile = serde_json::from_value(value)?;
        let index = file
            .chords
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        debug!(source, chords = file.chords.len(), "chord catalog loaded");
        Ok(Self {
            schema_version: file.schema_version,
            chords: file.chords,
            index,
        })
    }

    /// Read and validate a catalog file.
    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&text, &path.display().to_string())?;
        info!(path = %path.display(), chords = catalog.len(), "chord catalog file loaded");
        Ok(catalog)
    }

    /// Schema version string.
    #[inline]
    #[must_use]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Look a chord up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ChordDefinition> {
        self.index.get(id).map(|&i| &self.chords[i])
    }

    /// Whether the id is in the catalog.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of a chord.
    #[inline]
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Risk tier of a chord.
    #[must_use]
    pub fn risk_tier(&self, id: &str) -> Option<RiskTier> {
        self.get(id).map(|c| c.risk_tier)
    }

    /// Chords in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChordDefinition> {
        self.chords.iter()
    }

    /// Ids of the `safe` chords, in declaration order.
    #[must_use]
    pub fn safe_ids(&self) -> Vec<&str> {
        self.chords
            .iter()
            .filter(|c| c.is_safe())
            .map(|c| c.id.as_str())
            .collect()
    }

    /// Number of chords.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.chords.len()
    }

    /// Whether the catalog has no chords.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chords.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::SAFE_CHORD_IDS_V1;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = ChordCatalog::builtin_v1().unwrap();
        assert_eq!(catalog.schema_version(), "chord_catalog.v1");
        assert_eq!(catalog.len(), 8);
        assert_eq!(catalog.safe_ids(), SAFE_CHORD_IDS_V1.to_vec());
        assert_eq!(catalog.position("DRIFT-RETUNE"), Some(1));
        assert_eq!(catalog.risk_tier("TIMEOUT-GUARD"), Some(RiskTier::Advanced));
        assert!(catalog.iter().all(|c| !c.knobs_touched.is_empty() && !c.invariants.is_empty()));
    }

    #[test]
    fn test_one_bad_entry_rejects_everything() {
        let text = r#"{"schema_version":"chord_catalog.v1","chords":[
            {"id":"DRIFT-RETUNE","intent":"i","risk_tier":"safe","required_signals":["drift"],
             "invariants":["a"],"knobs_touched":["grad_accum_steps"]},
            {"id":"BAD","intent":"i","risk_tier":"advanced","required_signals":["drift"],
             "invariants":[],"knobs_touched":["grad_accum_steps"]}
        ]}"#;
        match ChordCatalog::from_json(text, "mem") {
            Err(CatalogError::Invalid { errors }) => assert_eq!(errors.len(), 1),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ChordCatalog::load_file(Path::new("/nonexistent/catalog.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
