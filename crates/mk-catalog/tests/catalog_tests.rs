use std::io::Write;

use mk_catalog::{CatalogError, CatalogValidator, ChordCatalog, RiskTier};
use proptest::prelude::*;

const BUILTIN: &str = include_str!("../catalog/chord_catalog.v1.json");

#[test]
fn test_load_file_round_trips_builtin() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(BUILTIN.as_bytes()).unwrap();

    let loaded = ChordCatalog::load_file(file.path()).unwrap();
    assert_eq!(loaded, ChordCatalog::builtin_v1().unwrap());
}

#[test]
fn test_validate_report_for_builtin() {
    let report = CatalogValidator::new().validate_str(BUILTIN, "builtin");
    assert!(report.ok);
    assert_eq!(report.schema_version, "chords_validate.v0");
    assert_eq!(report.chord_count, 8);
    assert_eq!(report.chord_ids.first().map(String::as_str), Some("BURST-ABSORB"));
}

#[test]
fn test_advanced_chords_are_outside_safe_set() {
    let catalog = ChordCatalog::builtin_v1().unwrap();
    for id in ["MEMORY-HEADROOM", "TIMEOUT-GUARD", "COMM-CONGESTION"] {
        assert_eq!(catalog.risk_tier(id), Some(RiskTier::Advanced));
    }
}

#[test]
fn test_promoting_an_advanced_chord_is_rejected() {
    let tampered = BUILTIN.replacen("\"risk_tier\": \"advanced\"", "\"risk_tier\": \"safe\"", 1);
    let err = ChordCatalog::from_json(&tampered, "tampered").unwrap_err();
    assert!(matches!(err, CatalogError::Invalid { .. }));
}

proptest! {
    #[test]
    fn prop_arbitrary_json_never_panics(text in ".{0,200}") {
        let report = CatalogValidator::new().validate_str(&text, "fuzz");
        prop_assert_eq!(report.ok, report.errors.is_empty());
        prop_assert!(!report.ok);
    }
}
