//! Closed set of policy variants selected by configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::action::ProposedAction;
use crate::chord::ChordPolicy;
use crate::error::PolicyError;
use crate::invariant::BatchInvariant;
use crate::scalar::ScalarPolicy;
use crate::strategy::{PolicyInput, PolicyStrategy};

/// Which policy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Catalog-driven chords.
    #[default]
    Chord,
    /// Scalar comparison baseline.
    Scalar,
}

impl PolicyKind {
    /// Config / CLI name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Chord => "chord",
            PolicyKind::Scalar => "scalar",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "chord" => Ok(PolicyKind::Chord),
            "scalar" => Ok(PolicyKind::Scalar),
            other => Err(PolicyError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Variant to run.
    pub kind: PolicyKind,
    /// Relative tolerance of the global batch invariant.
    pub batch_tolerance: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Chord,
            batch_tolerance: 0.05,
        }
    }
}

impl PolicyConfig {
    /// Set the variant.
    #[must_use]
    pub fn with_kind(mut self, kind: PolicyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the batch tolerance.
    #[must_use]
    pub fn with_batch_tolerance(mut self, tolerance: f64) -> Self {
        self.batch_tolerance = tolerance;
        self
    }
}

/// The configured policy.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Chord policy.
    Chord(ChordPolicy),
    /// Scalar baseline.
    Scalar(ScalarPolicy),
}

impl Policy {
    /// Build the variant named by the config.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        Ok(match config.kind {
            PolicyKind::Chord => Policy::Chord(ChordPolicy::new(BatchInvariant::new(
                config.batch_tolerance,
            )?)),
            PolicyKind::Scalar => Policy::Scalar(ScalarPolicy::new()),
        })
    }

    /// Variant kind.
    #[must_use]
    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Chord(_) => PolicyKind::Chord,
            Policy::Scalar(_) => PolicyKind::Scalar,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Chord(ChordPolicy::default())
    }
}

impl PolicyStrategy for Policy {
    fn propose(&self, input: &PolicyInput<'_>) -> Vec<ProposedAction> {
        match self {
            Policy::Chord(p) => p.propose(input),
            Policy::Scalar(p) => p.propose(input),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Policy::Chord(p) => p.name(),
            Policy::Scalar(p) => p.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("chord".parse::<PolicyKind>(), Ok(PolicyKind::Chord));
        assert_eq!(" scalar ".parse::<PolicyKind>(), Ok(PolicyKind::Scalar));
        assert_eq!(
            "pid".parse::<PolicyKind>(),
            Err(PolicyError::UnknownPolicy("pid".to_string()))
        );
    }

    #[test]
    fn test_from_config() {
        let policy = Policy::from_config(&PolicyConfig::default().with_kind(PolicyKind::Scalar)).unwrap();
        assert_eq!(policy.name(), "scalar");
        assert!(Policy::from_config(&PolicyConfig::default().with_batch_tolerance(2.0)).is_err());
    }
}
