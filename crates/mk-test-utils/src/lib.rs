//! Testing utilities for the ModeKeeper workspace
//!
//! Telemetry generators, license fixtures and a scripted cluster.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ed25519_dalek::SigningKey;
use mk_kernel::k8s::{AccessError, ClusterAccessor, CommandOutput};
use mk_kernel::{Result, TelemetrySource};
use mk_license::{encode_public_key, sign_document};
use mk_signals::{IngestStats, Ingested, TelemetrySample};
use serde_json::{json, Value};

// ============================================================================
// Telemetry
// ============================================================================

/// `len` samples one second apart with a constant step time.
pub fn stable_window(start_ms: i64, len: usize, latency_ms: f64) -> Vec<TelemetrySample> {
    (0..len)
        .map(|i| TelemetrySample::with_latency(start_ms + i as i64 * 1000, latency_ms))
        .collect()
}

/// First half at `base_ms`, second half at `base_ms * factor`.
pub fn step_window(start_ms: i64, len: usize, base_ms: f64, factor: f64) -> Vec<TelemetrySample> {
    (0..len)
        .map(|i| {
            let latency = if i < len / 2 { base_ms } else { base_ms * factor };
            TelemetrySample::with_latency(start_ms + i as i64 * 1000, latency)
        })
        .collect()
}

/// Render samples as JSON Lines.
pub fn to_jsonl(samples: &[TelemetrySample]) -> String {
    samples
        .iter()
        .map(|s| serde_json::to_string(s).unwrap() + "\n")
        .collect()
}

/// Telemetry source replaying prepared windows, then empty ones.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    windows: VecDeque<Vec<TelemetrySample>>,
}

impl ScriptedSource {
    pub fn new(windows: Vec<Vec<TelemetrySample>>) -> Self {
        Self {
            windows: windows.into(),
        }
    }
}

impl TelemetrySource for ScriptedSource {
    fn next_window(&mut self, _max_samples: usize) -> Result<Ingested> {
        Ok(Ingested {
            samples: self.windows.pop_front().unwrap_or_default(),
            stats: IngestStats::default(),
        })
    }
}

// ============================================================================
// Licenses
// ============================================================================

pub const ISSUED_AT: i64 = 1_700_000_000;
pub const EXPIRES_AT: i64 = 4_102_444_800;

/// Deterministic signing key.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Signed `license.v1` with the `apply` entitlement.
pub fn signed_license(signer: &SigningKey, kid: &str) -> Value {
    signed_license_with(signer, kid, &["apply"])
}

/// Signed `license.v1` with chosen entitlements.
pub fn signed_license_with(signer: &SigningKey, kid: &str, entitlements: &[&str]) -> Value {
    let mut doc = json!({
        "schema_version": "license.v1",
        "org": "Acme",
        "kid": kid,
        "issued_at": ISSUED_AT,
        "expires_at": EXPIRES_AT,
        "entitlements": entitlements,
    });
    doc["signature"] = json!(sign_document(&doc, signer));
    doc
}

/// License and keyring files in a temporary directory.
#[derive(Debug)]
pub struct LicenseFiles {
    pub dir: tempfile::TempDir,
    pub license: PathBuf,
    pub keys: PathBuf,
}

/// Write `license` and a keyring trusting `signer` under `keyring_kid`.
pub fn write_license_files(license: &Value, signer: &SigningKey, keyring_kid: &str) -> LicenseFiles {
    let dir = tempfile::tempdir().unwrap();
    let license_path = dir.path().join("license.json");
    let keys_path = dir.path().join("keys.json");
    std::fs::write(&license_path, serde_json::to_string_pretty(license).unwrap()).unwrap();
    let keys = json!({ keyring_kid: encode_public_key(&signer.verifying_key()) });
    std::fs::write(&keys_path, keys.to_string()).unwrap();
    LicenseFiles {
        dir,
        license: license_path,
        keys: keys_path,
    }
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug)]
struct Rule {
    fragments: Vec<String>,
    output: CommandOutput,
}

/// Fake cluster CLI.
///
/// Every call is recorded. The first rule whose fragments all appear in the
/// arguments answers it; otherwise the call succeeds (`yes` for
/// permission checks).
#[derive(Debug, Default)]
pub struct ScriptedCluster {
    rules: Vec<Rule>,
    missing: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose CLI is not installed.
    pub fn missing_cli() -> Self {
        Self {
            missing: true,
            ..Self::default()
        }
    }

    /// Answer calls containing every fragment with `output`.
    pub fn respond(mut self, fragments: &[&str], output: CommandOutput) -> Self {
        self.rules.push(Rule {
            fragments: fragments.iter().map(|f| (*f).to_string()).collect(),
            output,
        });
        self
    }

    /// Make `namespace` not exist.
    pub fn without_namespace(self, namespace: &str) -> Self {
        let not_found = format!("Error from server (NotFound): namespaces \"{namespace}\" not found");
        self.respond(&[&format!("namespace/{namespace}")], CommandOutput::failed(1, not_found.clone()))
            .respond(&["-n", namespace], CommandOutput::failed(1, not_found))
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Patch calls that were not dry runs.
    pub fn mutation_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.iter().any(|a| a == "patch") && !args.iter().any(|a| a.starts_with("--dry-run")))
            .count()
    }

    /// Dry-run patch calls.
    pub fn dry_run_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.iter().any(|a| a.starts_with("--dry-run")))
            .count()
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for ScriptedCluster {
    async fn run(&self, args: &[String]) -> std::result::Result<CommandOutput, AccessError> {
        self.calls.lock().unwrap().push(args.to_vec());
        if self.missing {
            return Err(AccessError::Missing("kubectl".to_string()));
        }
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.fragments.iter().all(|f| args.contains(f)));
        if let Some(rule) = rule {
            return Ok(rule.output.clone());
        }
        if args.iter().any(|a| a == "can-i") {
            return Ok(CommandOutput::ok("yes\n"));
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Temporary output directory.
pub fn out_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

/// Read a file as text.
pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}
