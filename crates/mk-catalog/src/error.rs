//! Catalog errors.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to load a chord catalog. Always fatal for the run.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("cannot read chord catalog {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Validation produced at least one message.
    #[error("chord catalog rejected: {}", errors.join("; "))]
    Invalid {
        /// Every validation message.
        errors: Vec<String>,
    },

    /// The validated document did not map onto the typed schema.
    #[error("chord catalog schema mismatch: {0}")]
    Schema(#[from] serde_json::Error),
}
