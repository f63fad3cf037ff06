//! Append-only decision trace.
//!
//! One JSON line per tick: sorted keys, compact separators, flushed before
//! the next tick starts. Lines are never rewritten. Each line carries the
//! SHA-256 of the previous line's record (`prev_hash`) and of its own
//! (`hash`), so truncation or edits are detectable with
//! [`verify_trace`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use mk_policy::ProposedAction;
use mk_signals::{Mode, SignalSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::apply_gate::ApplyDecision;
use crate::error::TraceError;
use crate::gate::GateDecision;
use crate::pipeline::Evaluation;

/// Schema of every trace line.
pub const TRACE_SCHEMA_VERSION: &str = "decision_trace_event.v0";

const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Chord reference; `id` is `"none"` when no chord applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChordRef {
    /// Chord id or `none`.
    pub id: String,
}

impl ChordRef {
    /// Reference for an optional chord.
    #[must_use]
    pub fn from_option(id: Option<&str>) -> Self {
        Self {
            id: id.unwrap_or("none").to_string(),
        }
    }
}

/// One tick of the decision trace, before chaining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTraceEvent {
    /// Always `decision_trace_event.v0`.
    pub schema_version: String,
    /// 1-based tick number within the session.
    pub tick: u64,
    /// Tick clock, epoch milliseconds.
    pub ts_ms: i64,
    /// Mode after the tick.
    pub mode: Mode,
    /// Window signals.
    pub signals: SignalSet,
    /// Chosen chord.
    pub chord: ChordRef,
    /// Proposed actions.
    pub actions: Vec<ProposedAction>,
    /// One decision per proposed action.
    pub gate_decisions: Vec<GateDecision>,
    /// Apply gate chain verdict, when apply was requested.
    pub apply: Option<ApplyDecision>,
    /// Count of every block code seen in the tick.
    pub blocked_reasons: BTreeMap<String, u64>,
}

impl DecisionTraceEvent {
    /// Event for an evaluated tick.
    #[must_use]
    pub fn from_evaluation(tick: u64, ts_ms: i64, evaluation: &Evaluation, apply: Option<ApplyDecision>) -> Self {
        Self::new(
            tick,
            ts_ms,
            evaluation.mode(),
            evaluation.signals.clone(),
            evaluation.chord.as_deref(),
            evaluation.actions.clone(),
            evaluation.gate_decisions.clone(),
            apply,
        )
    }

    /// Assemble an event, counting block codes.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: u64,
        ts_ms: i64,
        mode: Mode,
        signals: SignalSet,
        chord: Option<&str>,
        actions: Vec<ProposedAction>,
        gate_decisions: Vec<GateDecision>,
        apply: Option<ApplyDecision>,
    ) -> Self {
        let mut blocked_reasons: BTreeMap<String, u64> = BTreeMap::new();
        let reasons = gate_decisions
            .iter()
            .filter_map(|d| d.reason_code)
            .chain(apply.as_ref().and_then(|a| a.block_reason));
        for reason in reasons {
            *blocked_reasons.entry(reason.as_str().to_string()).or_default() += 1;
        }
        Self {
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            tick,
            ts_ms,
            mode,
            signals,
            chord: ChordRef::from_option(chord),
            actions,
            gate_decisions,
            apply,
            blocked_reasons,
        }
    }
}

/// Open-append writer for the trace file.
#[derive(Debug)]
pub struct DecisionTraceWriter {
    path: PathBuf,
    file: File,
    last_hash: [u8; 32],
    written: u64,
}

impl DecisionTraceWriter {
    /// Open for appending, continuing the hash chain of existing lines.
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let io_err = |source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let last_hash = if path.exists() {
            verify_trace(path)?.last_hash
        } else {
            GENESIS_HASH
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            last_hash,
            written: 0,
        })
    }

    /// Trace file.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written by this writer.
    #[inline]
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Hash of the last line, hex.
    #[must_use]
    pub fn last_hash(&self) -> String {
        hex::encode(self.last_hash)
    }

    /// Append one event and flush. Returns the line's hash, hex.
    pub fn append(&mut self, event: &DecisionTraceEvent) -> Result<String, TraceError> {
        let body = serde_json::to_value(event)?;
        let hash = chain_hash(&self.last_hash, &body)?;

        let mut record = body;
        if let Value::Object(map) = &mut record {
            map.insert("prev_hash".to_string(), Value::String(hex::encode(self.last_hash)));
            map.insert("hash".to_string(), Value::String(hex::encode(hash)));
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let io_err = |source| TraceError::Io {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(line.as_bytes()).map_err(io_err)?;
        self.file.flush().map_err(io_err)?;

        self.last_hash = hash;
        self.written += 1;
        debug!(tick = event.tick, hash = %hex::encode(hash), "trace appended");
        Ok(hex::encode(hash))
    }
}

/// Outcome of a successful [`verify_trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSummary {
    /// Lines checked.
    pub lines: usize,
    /// Hash of the last line.
    pub last_hash: [u8; 32],
}

/// Check every line's schema and hash chain.
pub fn verify_trace(path: &Path) -> Result<TraceSummary, TraceError> {
    let file = File::open(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut prev = GENESIS_HASH;
    let mut lines = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let corrupt = |reason: &str| TraceError::Corrupt {
            line: line_no,
            reason: reason.to_string(),
        };

        let mut record: Value = serde_json::from_str(&line).map_err(|_| corrupt("not JSON"))?;
        let map = record.as_object_mut().ok_or_else(|| corrupt("not an object"))?;
        if map.get("schema_version").and_then(Value::as_str) != Some(TRACE_SCHEMA_VERSION) {
            return Err(corrupt("unexpected schema_version"));
        }
        let stored_prev = map
            .remove("prev_hash")
            .and_then(|v| v.as_str().and_then(decode_hash))
            .ok_or_else(|| corrupt("missing prev_hash"))?;
        let stored_hash = map
            .remove("hash")
            .and_then(|v| v.as_str().and_then(decode_hash))
            .ok_or_else(|| corrupt("missing hash"))?;

        if stored_prev != prev {
            return Err(corrupt("prev_hash does not match the previous line"));
        }
        if chain_hash(&prev, &record)? != stored_hash {
            return Err(corrupt("hash does not match the record"));
        }
        prev = stored_hash;
        lines += 1;
    }
    Ok(TraceSummary {
        lines,
        last_hash: prev,
    })
}

fn chain_hash(prev: &[u8; 32], body: &Value) -> Result<[u8; 32], TraceError> {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update([0]);
    hasher.update(serde_json::to_vec(body)?);
    Ok(hasher.finalize().into())
}

fn decode_hash(text: &str) -> Option<[u8; 32]> {
    hex::decode(text).ok()?.try_into().ok()
}
