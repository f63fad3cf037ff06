//! Policy errors.

use thiserror::Error;

/// Policy configuration and knob errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Policy name other than `chord` or `scalar`.
    #[error("unknown policy '{0}' (expected 'chord' or 'scalar')")]
    UnknownPolicy(String),

    /// Knob not in the registry.
    #[error("unknown knob '{0}'")]
    UnknownKnob(String),

    /// Batch tolerance outside `[0, 1)`.
    #[error("batch tolerance must be in [0, 1), got {0}")]
    InvalidTolerance(String),
}
