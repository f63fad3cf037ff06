//! Agent configuration.
//!
//! Built from defaults, an optional TOML file, then environment overrides:
//!
//! | variable                               | field                          |
//! |----------------------------------------|--------------------------------|
//! | `MODEKEEPER_LICENSE_PATH`              | `license.license_path`         |
//! | `MODEKEEPER_LICENSE_PUBLIC_KEYS_PATH`  | `license.public_keys_path`     |
//! | `KUBECTL`                              | `cluster.kubectl`              |
//!
//! Every value is validated before the first tick; an invalid one is fatal.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use mk_license::{Keyring, LicenseVerifier, TrustChain, VerifierOptions};
use mk_policy::{BatchInvariant, KnobState, PolicyConfig};
use mk_signals::{AnalyzerConfig, ModeConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ConfigError, KernelError};
use crate::gate::GateConfig;
use crate::k8s::ClusterConfig;

/// License file override.
pub const ENV_LICENSE_PATH: &str = "MODEKEEPER_LICENSE_PATH";
/// Public key allowlist override.
pub const ENV_PUBLIC_KEYS_PATH: &str = "MODEKEEPER_LICENSE_PUBLIC_KEYS_PATH";
/// Cluster CLI override.
pub const ENV_KUBECTL: &str = "KUBECTL";

/// License settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// `license.v1` document.
    pub license_path: Option<PathBuf>,
    /// `{kid: key}` allowlist. Root keys in trust-chain mode.
    pub public_keys_path: Option<PathBuf>,
    /// Root-signed `issuer_keyset.v1`; enables trust-chain mode.
    pub issuer_keyset_path: Option<PathBuf>,
    /// Entitlement required to apply.
    pub required_entitlement: String,
    /// Accept kid-less licenses by scanning the allowlist.
    pub allow_kidless_scan: bool,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            license_path: None,
            public_keys_path: None,
            issuer_keyset_path: None,
            required_entitlement: "apply".to_string(),
            allow_kidless_scan: false,
        }
    }
}

impl LicenseConfig {
    /// Set the license file.
    #[must_use]
    pub fn with_license_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.license_path = Some(path.into());
        self
    }

    /// Set the public key allowlist.
    #[must_use]
    pub fn with_public_keys_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_keys_path = Some(path.into());
        self
    }

    /// Build the verifier. An unreadable keyring or keyset is fatal.
    pub fn build_verifier(&self) -> Result<LicenseVerifier, KernelError> {
        let keyring = match &self.public_keys_path {
            Some(path) => Keyring::load_file(path)?,
            None => {
                warn!("no public keys configured, every license will be rejected");
                Keyring::new()
            }
        };
        let options = VerifierOptions {
            allow_kidless_scan: self.allow_kidless_scan,
        };

        let verifier = match &self.issuer_keyset_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| KernelError::io(path, e))?;
                let keyset: Value = serde_json::from_str(&text).map_err(|e| {
                    ConfigError::invalid("license.issuer_keyset_path", format!("{}: {e}", path.display()))
                })?;
                LicenseVerifier::with_trust_chain(TrustChain::new(keyring, keyset))
            }
            None => LicenseVerifier::new(keyring),
        };
        Ok(verifier.with_options(options))
    }

    /// Read the license document. `None` when there is nothing to read.
    #[must_use]
    pub fn read_license(&self) -> Option<String> {
        let path = self.license_path.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "license not readable");
                None
            }
        }
    }
}

/// Watch loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Delay between ticks.
    pub interval_ms: u64,
    /// Stop after this many ticks. Unbounded when `None`.
    pub max_ticks: Option<u64>,
    /// Only the newest samples of the source are analyzed per tick.
    pub window_samples: usize,
    /// Run verify and apply after each tick.
    pub apply: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_ticks: None,
            window_samples: 256,
            apply: false,
        }
    }
}

impl WatchConfig {
    /// Set the tick interval.
    #[must_use]
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Bound the loop.
    #[must_use]
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    /// Enable verify + apply.
    #[must_use]
    pub fn with_apply(mut self, apply: bool) -> Self {
        self.apply = apply;
        self
    }
}

/// Workload knob settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Known current knob values; others start at their registry default.
    pub knobs: BTreeMap<String, i64>,
    /// Data-parallel world size.
    pub world_size: Option<i64>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Chord catalog file. The builtin `chord_catalog.v1` when `None`.
    pub catalog_path: Option<PathBuf>,
    /// Signal thresholds.
    pub analyzer: AnalyzerConfig,
    /// Hysteresis.
    pub mode: ModeConfig,
    /// Policy variant.
    pub policy: PolicyConfig,
    /// Safety gate.
    pub gate: GateConfig,
    /// Cluster access.
    pub cluster: ClusterConfig,
    /// Watch loop.
    pub watch: WatchConfig,
    /// License verification.
    pub license: LicenseConfig,
    /// Workload knobs.
    pub workload: WorkloadConfig,
    /// Directory for the decision trace and reports. `mk_out` when `None`.
    pub out_dir: Option<PathBuf>,
}

/// Output directory used when none is configured.
pub const DEFAULT_OUT_DIR: &str = "mk_out";

impl AgentConfig {
    /// Directory for the decision trace and reports.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.out_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR))
    }

    /// Defaults, the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var_os(key))
    }

    /// Parse a TOML file without environment overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply environment overrides from `lookup`, then validate.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if let Some(path) = non_empty_env(&lookup, ENV_LICENSE_PATH)? {
            self.license.license_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env(&lookup, ENV_PUBLIC_KEYS_PATH)? {
            self.license.public_keys_path = Some(PathBuf::from(path));
        }
        if let Some(kubectl) = non_empty_env(&lookup, ENV_KUBECTL)? {
            self.cluster.kubectl = kubectl.into_string().map_err(|_| {
                ConfigError::invalid(ENV_KUBECTL, "not valid UTF-8")
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check every value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.analyzer;
        for (field, value) in [
            ("analyzer.drift_ratio", a.drift_ratio),
            ("analyzer.burst_ratio", a.burst_ratio),
            ("analyzer.straggler_threshold", a.straggler_threshold),
            ("analyzer.loss_drift_ratio", a.loss_drift_ratio),
        ] {
            if !value.is_finite() || value <= 1.0 {
                return Err(ConfigError::invalid(field, format!("must be a ratio above 1, got {value}")));
            }
        }
        if !(a.gpu_ceiling_pct > 0.0 && a.gpu_ceiling_pct <= 100.0) {
            return Err(ConfigError::invalid(
                "analyzer.gpu_ceiling_pct",
                format!("must be in (0, 100], got {}", a.gpu_ceiling_pct),
            ));
        }
        if a.min_window == 0 {
            return Err(ConfigError::invalid("analyzer.min_window", "must be at least 1"));
        }
        if self.mode.confirm_windows == 0 || self.mode.recover_windows == 0 {
            return Err(ConfigError::invalid("mode", "window counts must be at least 1"));
        }
        BatchInvariant::new(self.policy.batch_tolerance)
            .map_err(|e| ConfigError::invalid("policy.batch_tolerance", e.to_string()))?;
        if self.gate.max_delta_per_step < 0 {
            return Err(ConfigError::invalid("gate.max_delta_per_step", "must not be negative"));
        }
        if self.cluster.kubectl.trim().is_empty() {
            return Err(ConfigError::invalid("cluster.kubectl", "must not be empty"));
        }
        if self.cluster.namespace.trim().is_empty() || self.cluster.deployment.trim().is_empty() {
            return Err(ConfigError::invalid("cluster", "namespace and deployment must not be empty"));
        }
        if self.cluster.timeout_ms == 0 {
            return Err(ConfigError::invalid("cluster.timeout_ms", "must be positive"));
        }
        if self.watch.interval_ms == 0 {
            return Err(ConfigError::invalid("watch.interval_ms", "must be positive"));
        }
        if self.watch.window_samples == 0 {
            return Err(ConfigError::invalid("watch.window_samples", "must be at least 1"));
        }
        if self.license.required_entitlement.trim().is_empty() {
            return Err(ConfigError::invalid("license.required_entitlement", "must not be empty"));
        }
        self.initial_knobs()?;
        Ok(())
    }

    /// Knob state the session starts from.
    pub fn initial_knobs(&self) -> Result<KnobState, ConfigError> {
        let mut state = KnobState::default();
        if let Some(world_size) = self.workload.world_size {
            if world_size < 1 {
                return Err(ConfigError::invalid("workload.world_size", "must be at least 1"));
            }
            state = state.with_world_size(world_size);
        }
        for (knob, value) in &self.workload.knobs {
            state = state
                .with_value(knob, *value)
                .map_err(|e| ConfigError::invalid(format!("workload.knobs.{knob}"), e.to_string()))?;
        }
        Ok(state)
    }
}

fn non_empty_env<F>(lookup: &F, key: &str) -> Result<Option<OsString>, ConfigError>
where
    F: Fn(&str) -> Option<OsString>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.is_empty() => Err(ConfigError::invalid(key, "set but empty")),
        Some(value) => Ok(Some(value)),
    }
}
