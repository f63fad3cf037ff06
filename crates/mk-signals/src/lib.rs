//! ModeKeeper Signals
//!
//! Turns a telemetry window into signals and signals into an operating mode.
//!
//! # Overview
//!
//! - **ingest**: JSON Lines normalization with per-reason drop counters
//! - **[`SignalAnalyzer`]**: drift / burst / straggler / GPU saturation detection
//! - **[`ModeStateMachine`]**: hysteresis over consecutive windows
//!
//! # Example
//!
//! ```rust
//! use mk_signals::{ingest_str, Mode, ModeStateMachine, SignalAnalyzer};
//!
//! let text = (0..8)
//!     .map(|i| format!("{{\"ts\": {}, \"step_time_ms\": 100}}", 1_700_000_000 + i))
//!     .collect::<Vec<_>>()
//!     .join("\n");
//! let window = ingest_str(&text);
//! let signals = SignalAnalyzer::default().analyze(&window.samples);
//!
//! let mut modes = ModeStateMachine::default();
//! assert_eq!(modes.observe(&signals).to, Mode::Normal);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod analyzer;
pub mod ingest;
pub mod mode;
pub mod sample;

pub use analyzer::{AnalyzerConfig, EnvironmentFingerprint, Evidence, SignalAnalyzer, SignalSet};
pub use ingest::{ingest_reader, ingest_str, IngestStats, Ingested, RecordRejection};
pub use mode::{
    allowed_transitions, candidate_mode, validate_transition, Mode, ModeConfig, ModeStateMachine,
    ModeTransition, StateMachineError,
};
pub use sample::TelemetrySample;
