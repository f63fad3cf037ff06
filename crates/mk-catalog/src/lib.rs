//! ModeKeeper Chord Catalog
//!
//! A chord is a named macro-operation over several related knobs. The
//! catalog is data: a validated arena of [`ChordDefinition`]s in declaration
//! order, looked up by id.
//!
//! # Example
//!
//! ```rust
//! use mk_catalog::{ChordCatalog, RiskTier};
//!
//! let catalog = ChordCatalog::builtin_v1().unwrap();
//! assert_eq!(catalog.risk_tier("DRIFT-RETUNE"), Some(RiskTier::Safe));
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod catalog;
pub mod chord;
pub mod error;
pub mod validation;

pub use catalog::ChordCatalog;
pub use chord::{is_safe_chord_id, ChordDefinition, RiskTier, SAFE_CHORD_IDS_V1};
pub use error::CatalogError;
pub use validation::{
    CatalogValidator, ValidationReport, CATALOG_SCHEMA_VERSION, VALIDATE_SCHEMA_VERSION,
};
