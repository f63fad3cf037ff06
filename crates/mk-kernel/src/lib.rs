//! ModeKeeper Kernel
//!
//! Verify-first closed-loop control for training workloads.
//!
//! # Overview
//!
//! - [`Evaluator`]: the read-only decision path, from telemetry window to
//!   gate decisions, never touching a cluster
//! - [`SafetyGate`]: one allow/block decision per proposed action
//! - [`ApplyGate`]: kill switch → license → verify, first failure wins
//! - [`k8s`]: plan building, per-object verification and patching through a
//!   [`ClusterAccessor`]
//! - [`DecisionTraceWriter`]: append-only, hash-chained per-tick audit log
//! - [`WatchSession`]: sequential tick loop owning mode, cooldowns and trace
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mk_kernel::prelude::*;
//!
//! let config = AgentConfig::load(Some(path))?;
//! let evaluator = Evaluator::from_config(&config)?;
//! let mut state = DecisionState::from_config(&config)?;
//! let evaluation = evaluator.evaluate(&mut state, &samples, now_ms);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod apply_gate;
pub mod config;
pub mod error;
pub mod gate;
pub mod k8s;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod trace;

pub use apply_gate::{ApplyDecision, ApplyGate, KillSwitch, KILL_SWITCH_ENV};
pub use config::{AgentConfig, LicenseConfig, WatchConfig, WorkloadConfig};
pub use error::{ConfigError, KernelError, Result, TraceError};
pub use gate::{BlockReason, CooldownStore, GateConfig, GateDecision, GateOutcome, SafetyGate};
pub use k8s::{ClusterAccessor, ClusterConfig, CommandOutput, K8sPlan, Kubectl, PlanTarget, VerifyReport};
pub use pipeline::{DecisionState, Evaluation, Evaluator};
pub use report::{render_report, write_report};
pub use session::{
    run_eval, ApplyContext, ApplyOutcome, EvalSummary, JsonlFileSource, SessionSummary, TelemetrySource,
    TickReport, WatchSession,
};
pub use trace::{verify_trace, DecisionTraceEvent, DecisionTraceWriter, TRACE_SCHEMA_VERSION};

/// Common imports.
pub mod prelude {
    pub use crate::apply_gate::{ApplyDecision, ApplyGate, KillSwitch};
    pub use crate::config::AgentConfig;
    pub use crate::error::{KernelError, Result};
    pub use crate::gate::{BlockReason, GateDecision};
    pub use crate::pipeline::{DecisionState, Evaluation, Evaluator};
    pub use crate::session::{ApplyContext, JsonlFileSource, WatchSession};
    pub use mk_signals::{Mode, SignalSet, TelemetrySample};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
