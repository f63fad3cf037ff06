//! Error types for the ModeKeeper kernel
//!
//! Gate blocks and per-object cluster failures are *results*, not errors.
//! What remains here is:
//! - Fatal misconfiguration (catalog, keyring, config values)
//! - Malformed K8s plans (the whole plan is rejected)
//! - Trace and report I/O

use std::path::PathBuf;

use mk_catalog::CatalogError;
use mk_license::{KeyringError, TrustChainError};
use mk_policy::PolicyError;

use crate::k8s::PlanError;

/// Main kernel error type
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Chord catalog could not be loaded or failed validation
    #[error("chord catalog: {0}")]
    Catalog(#[from] CatalogError),

    /// Public key allowlist could not be loaded
    #[error("license keyring: {0}")]
    Keyring(#[from] KeyringError),

    /// Issuer keyset rejected at startup
    #[error("license trust chain: {0}")]
    TrustChain(#[from] TrustChainError),

    /// Policy could not be built from its settings
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),

    /// Configuration error
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Decision trace could not be written
    #[error("decision trace: {0}")]
    Trace(#[from] TraceError),

    /// K8s plan rejected
    #[error("k8s plan: {0}")]
    Plan(#[from] PlanError),

    /// Any other file access
    #[error("cannot access {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl KernelError {
    /// Whether the run must abort before (or instead of) executing ticks.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Catalog(_)
                | KernelError::Keyring(_)
                | KernelError::TrustChain(_)
                | KernelError::Policy(_)
                | KernelError::Config(_)
                | KernelError::Plan(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KernelError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::AgentConfig`]
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range or unusable
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field or environment variable name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Decision trace errors
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Trace file could not be opened or written
    #[error("{path}: {source}")]
    Io {
        /// Trace file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Event could not be serialized
    #[error("cannot serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A line of an existing trace is not a valid event
    #[error("line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result alias for kernel operations
pub type Result<T> = std::result::Result<T, KernelError>;
