//! Evaluation runs and the watch session.
//!
//! A tick is `ingest → evaluate → (apply) → trace`, executed to completion
//! before the next one starts. The session owns the only carried state:
//! mode hysteresis, cooldowns, knob values and the trace writer.
//!
//! Interrupts are observed between ticks only; the summary report is
//! written before [`WatchSession::run_until`] returns.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mk_license::{BindingContext, LicenseVerification, LicenseVerifier};
use mk_policy::{PolicyStrategy, ProposedAction};
use mk_signals::{ingest_reader, IngestStats, Ingested, Mode, TelemetrySample};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::apply_gate::{ApplyDecision, ApplyGate, KillSwitch};
use crate::config::{AgentConfig, LicenseConfig};
use crate::error::{KernelError, Result};
use crate::gate::GateDecision;
use crate::k8s::{
    current_context, ApplyReport, ClusterAccessor, K8sPlan, Kubectl, PlanApplier, PlanTarget, PlanVerifier,
    VerifyReport,
};
use crate::pipeline::{sliding_windows, window_clock, DecisionState, Evaluation, Evaluator};
use crate::report::write_report;
use crate::trace::{DecisionTraceEvent, DecisionTraceWriter};

/// Trace file name inside the output directory.
pub const TRACE_FILE: &str = "decision_trace.jsonl";
/// Watch summary file name inside the output directory.
pub const SUMMARY_FILE: &str = "summary.json";
/// Eval summary file name inside the output directory.
pub const EVAL_SUMMARY_FILE: &str = "eval_summary.json";

/// Schema of [`TickReport`].
pub const TICK_REPORT_SCHEMA_VERSION: &str = "tick_report.v0";
/// Schema of [`SessionSummary`].
pub const WATCH_SUMMARY_SCHEMA_VERSION: &str = "watch_summary.v0";
/// Schema of [`EvalSummary`].
pub const EVAL_SUMMARY_SCHEMA_VERSION: &str = "eval_summary.v0";

// ============================================================================
// Telemetry sources
// ============================================================================

/// Yields one telemetry window per tick.
pub trait TelemetrySource: Send + Debug {
    /// Read the newest window, at most `max_samples` long.
    fn next_window(&mut self, max_samples: usize) -> Result<Ingested>;
}

/// JSON Lines file, re-read on every tick.
///
/// The file handle is closed before the window is returned, so a log that
/// is still being written can be tailed without holding it open.
#[derive(Debug, Clone)]
pub struct JsonlFileSource {
    path: PathBuf,
}

impl JsonlFileSource {
    /// Source over a file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File being read.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySource for JsonlFileSource {
    fn next_window(&mut self, max_samples: usize) -> Result<Ingested> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "telemetry file not found, empty window");
                return Ok(Ingested::default());
            }
            Err(err) => return Err(KernelError::io(&self.path, err)),
        };
        let mut ingested = ingest_reader(BufReader::new(file));
        keep_newest(&mut ingested.samples, max_samples);
        Ok(ingested)
    }
}

fn keep_newest(samples: &mut Vec<TelemetrySample>, max_samples: usize) {
    if max_samples > 0 && samples.len() > max_samples {
        let excess = samples.len() - max_samples;
        samples.drain(..excess);
    }
}

// ============================================================================
// Apply path
// ============================================================================

/// Everything a tick needs to plan, verify and apply its allowed actions.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    accessor: Arc<dyn ClusterAccessor>,
    verifier: LicenseVerifier,
    license: LicenseConfig,
    target: PlanTarget,
    binding: BindingContext,
    kill_switch: Option<KillSwitch>,
}

impl ApplyContext {
    /// Create over an accessor. The kill switch is read from the
    /// environment on every tick unless overridden.
    #[must_use]
    pub fn new(
        accessor: Arc<dyn ClusterAccessor>,
        verifier: LicenseVerifier,
        license: LicenseConfig,
        target: PlanTarget,
    ) -> Self {
        Self {
            accessor,
            verifier,
            license,
            target,
            binding: BindingContext::default(),
            kill_switch: None,
        }
    }

    /// Create from configuration, talking to the cluster through `kubectl`.
    ///
    /// The license binding uses the configured context, or the CLI's
    /// current context when none is configured.
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        let accessor: Arc<dyn ClusterAccessor> = Arc::new(Kubectl::new(&config.cluster));
        let verifier = config.license.build_verifier()?;
        let context = match &config.cluster.context {
            Some(context) => Some(context.clone()),
            None => current_context(accessor.as_ref()).await,
        };
        let binding = match context {
            Some(context) => BindingContext::default().with_kube_context(context),
            None => {
                debug!("kube context unknown");
                BindingContext::default()
            }
        };
        let target = PlanTarget::new(&config.cluster.namespace, &config.cluster.deployment);
        Ok(Self::new(accessor, verifier, config.license.clone(), target).with_binding(binding))
    }

    /// Set the license binding context.
    #[must_use]
    pub fn with_binding(mut self, binding: BindingContext) -> Self {
        self.binding = binding;
        self
    }

    /// Pin the kill switch instead of reading the environment.
    #[must_use]
    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    /// Plan target.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &PlanTarget {
        &self.target
    }

    /// Cluster accessor.
    #[inline]
    #[must_use]
    pub fn accessor(&self) -> &dyn ClusterAccessor {
        self.accessor.as_ref()
    }

    /// Verify the license document now.
    #[must_use]
    pub fn verify_license(&self) -> LicenseVerification {
        let raw = self.license.read_license();
        self.verifier.verify(
            raw.as_deref(),
            &self.license.required_entitlement,
            chrono::Utc::now().timestamp(),
            &self.binding,
        )
    }

    /// Kill switch for this call.
    #[must_use]
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.unwrap_or_else(KillSwitch::from_env)
    }

    /// Plan the allowed actions, run the gate chain and apply if it passes.
    pub async fn execute(&self, decisions: &[GateDecision]) -> Result<ApplyOutcome> {
        let allowed = decisions.iter().filter(|d| d.allowed).map(|d| &d.action);
        let plan = K8sPlan::build(allowed.clone(), &self.target)?;
        Ok(self.execute_plan(plan, allowed.count()).await)
    }

    /// Run the gate chain for a built plan and apply it if every gate passes.
    ///
    /// Verification only runs when the kill switch is off and the license
    /// is valid. `allowed_actions` is the number of approved changes the
    /// plan carries.
    pub async fn execute_plan(&self, plan: K8sPlan, allowed_actions: usize) -> ApplyOutcome {
        let kill_switch = self.kill_switch();
        let license = self.verify_license();
        let verify = if kill_switch.is_active() || !license.ok {
            None
        } else {
            Some(PlanVerifier::new(self.accessor.as_ref()).verify(&plan).await)
        };

        let mut decision = ApplyGate::evaluate_allowed(allowed_actions, kill_switch, &license, verify.as_ref());
        let report = if decision.permits_apply() {
            let report = PlanApplier::new(self.accessor.as_ref()).apply(&plan).await;
            decision.record_apply(&report);
            Some(report)
        } else {
            None
        };

        ApplyOutcome {
            plan,
            license,
            verify,
            decision,
            report,
        }
    }
}

/// Everything the apply path produced for one tick.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// Plan built from the allowed actions.
    pub plan: K8sPlan,
    /// License outcome.
    pub license: LicenseVerification,
    /// Verify report, when verification ran.
    pub verify: Option<VerifyReport>,
    /// Gate chain verdict.
    pub decision: ApplyDecision,
    /// Mutation outcome, when the mutation ran.
    pub report: Option<ApplyReport>,
}

impl ApplyOutcome {
    /// Whether the mutation ran and every object succeeded.
    #[inline]
    #[must_use]
    pub fn applied(&self) -> bool {
        self.decision.apply_ok == Some(true)
    }
}

// ============================================================================
// Watch session
// ============================================================================

/// Record of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Always `tick_report.v0`.
    pub schema_version: String,
    /// 1-based tick number.
    pub tick: u64,
    /// Tick clock, epoch milliseconds.
    pub ts_ms: i64,
    /// Ingest drop counters of the window.
    pub ingest: IngestStats,
    /// Decision path output.
    pub evaluation: Evaluation,
    /// Apply path output, when apply is enabled.
    pub apply: Option<ApplyOutcome>,
    /// Hash of the trace line written for the tick.
    pub trace_hash: String,
}

/// Final report of a watch session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Always `watch_summary.v0`.
    pub schema_version: String,
    /// Ticks completed.
    pub ticks: u64,
    /// Stopped by an operator interrupt.
    pub interrupted: bool,
    /// Mode after the last tick.
    pub final_mode: Mode,
    /// Trace file.
    pub trace_path: PathBuf,
    /// Hash of the last trace line.
    pub trace_last_hash: String,
    /// Last tick, if any ran.
    pub last_tick: Option<TickReport>,
    /// Error that stopped the session early.
    pub error: Option<String>,
}

/// Sequential tick loop over one telemetry source.
#[derive(Debug)]
pub struct WatchSession {
    config: AgentConfig,
    evaluator: Evaluator,
    state: DecisionState,
    source: Box<dyn TelemetrySource>,
    trace: DecisionTraceWriter,
    apply: Option<ApplyContext>,
    tick: u64,
    clock_ms: i64,
    last: Option<TickReport>,
}

impl WatchSession {
    /// Create a read-only session. Fatal misconfiguration fails here,
    /// before any tick runs.
    pub fn new(config: AgentConfig, source: Box<dyn TelemetrySource>) -> Result<Self> {
        config.validate()?;
        let evaluator = Evaluator::from_config(&config)?;
        let state = DecisionState::from_config(&config)?;
        let trace = DecisionTraceWriter::open(&config.out_dir().join(TRACE_FILE))?;
        info!(
            trace = %trace.path().display(),
            interval_ms = config.watch.interval_ms,
            max_ticks = ?config.watch.max_ticks,
            "watch session ready"
        );
        Ok(Self {
            config,
            evaluator,
            state,
            source,
            trace,
            apply: None,
            tick: 0,
            clock_ms: 0,
            last: None,
        })
    }

    /// Enable the apply path.
    #[must_use]
    pub fn with_apply(mut self, apply: ApplyContext) -> Self {
        self.apply = Some(apply);
        self
    }

    /// Ticks completed.
    #[inline]
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Carried decision state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &DecisionState {
        &self.state
    }

    /// Trace file.
    #[inline]
    #[must_use]
    pub fn trace_path(&self) -> &Path {
        self.trace.path()
    }

    /// Run one tick to completion.
    pub async fn tick(&mut self) -> Result<&TickReport> {
        let tick = self.tick + 1;
        let ingested = self.source.next_window(self.config.watch.window_samples)?;
        if ingested.stats.dropped_total() > 0 {
            warn!(
                tick,
                dropped = ingested.stats.dropped_total(),
                invalid_json = ingested.stats.dropped_invalid_json,
                invalid_shape = ingested.stats.dropped_invalid_shape,
                missing_fields = ingested.stats.dropped_missing_fields,
                duplicate = ingested.stats.dropped_duplicate,
                "telemetry records dropped"
            );
        }

        self.clock_ms = window_clock(&ingested.samples, self.clock_ms);
        let evaluation = self.evaluator.evaluate(&mut self.state, &ingested.samples, self.clock_ms);

        let apply = match &self.apply {
            Some(context) => Some(context.execute(&evaluation.gate_decisions).await?),
            None => None,
        };
        if apply.as_ref().is_some_and(ApplyOutcome::applied) {
            let allowed: Vec<&ProposedAction> = evaluation.allowed_actions().collect();
            commit_applied(&mut self.state, &allowed, self.clock_ms);
        }

        let event = DecisionTraceEvent::from_evaluation(
            tick,
            self.clock_ms,
            &evaluation,
            apply.as_ref().map(|a| a.decision.clone()),
        );
        let trace_hash = self.trace.append(&event)?;
        self.tick = tick;
        info!(
            tick,
            mode = %evaluation.mode(),
            chord = evaluation.chord.as_deref().unwrap_or("none"),
            actions = evaluation.actions.len(),
            allowed = evaluation.allowed_actions().count(),
            "tick complete"
        );

        let report = TickReport {
            schema_version: TICK_REPORT_SCHEMA_VERSION.to_string(),
            tick,
            ts_ms: self.clock_ms,
            ingest: ingested.stats,
            evaluation,
            apply,
            trace_hash,
        };
        let report: &TickReport = self.last.insert(report);
        Ok(report)
    }

    /// Run until `max_ticks` or Ctrl-C.
    pub async fn run(self) -> Result<SessionSummary> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `max_ticks` or until `shutdown` resolves.
    ///
    /// `shutdown` is only polled between ticks, never while one runs.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<SessionSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.watch.interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut interrupted = false;
        loop {
            if self.config.watch.max_ticks.is_some_and(|max| self.tick >= max) {
                break;
            }
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!(ticks = self.tick, "interrupt received, stopping");
                    interrupted = true;
                    break;
                }
                _ = interval.tick() => {}
            }
            if let Err(err) = self.tick().await.map(|_| ()) {
                error!(tick = self.tick + 1, error = %err, "tick failed, stopping");
                if let Err(write_err) = self.finish_with(interrupted, Some(err.to_string())) {
                    warn!(error = %write_err, "cannot write summary after failed tick");
                }
                return Err(err);
            }
        }
        self.finish(interrupted)
    }

    /// Write the summary report and close the session.
    pub fn finish(self, interrupted: bool) -> Result<SessionSummary> {
        self.finish_with(interrupted, None)
    }

    fn finish_with(self, interrupted: bool, error: Option<String>) -> Result<SessionSummary> {
        let summary = SessionSummary {
            schema_version: WATCH_SUMMARY_SCHEMA_VERSION.to_string(),
            ticks: self.tick,
            interrupted,
            final_mode: self.state.mode(),
            trace_path: self.trace.path().to_path_buf(),
            trace_last_hash: self.trace.last_hash(),
            last_tick: self.last,
            error,
        };
        write_report(&self.config.out_dir().join(SUMMARY_FILE), &summary)?;
        info!(ticks = summary.ticks, mode = %summary.final_mode, "watch session finished");
        Ok(summary)
    }
}

/// Carry a successful apply into the session state.
fn commit_applied(state: &mut DecisionState, allowed: &[&ProposedAction], now_ms: i64) {
    state.knobs.apply_actions(allowed.iter().copied());
    for action in allowed {
        if let Some(chord) = &action.chord_id {
            state.cooldowns.record_applied(chord, now_ms);
        }
    }
}

// ============================================================================
// Offline evaluation
// ============================================================================

/// Digest of one evaluated window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowDigest {
    /// 1-based window number.
    pub tick: u64,
    /// Window clock.
    pub ts_ms: i64,
    /// Mode after the window.
    pub mode: Mode,
    /// Chosen chord.
    pub chord: Option<String>,
    /// Proposed actions.
    pub actions: usize,
    /// Actions the safety gate let through.
    pub allowed: usize,
}

/// Report of an offline evaluation over recorded telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalSummary {
    /// Always `eval_summary.v0`.
    pub schema_version: String,
    /// Ingest drop counters over the whole input.
    pub ingest: IngestStats,
    /// Policy variant.
    pub policy: String,
    /// One digest per window.
    pub windows: Vec<WindowDigest>,
    /// Count of every block code over all windows.
    pub blocked_reasons: BTreeMap<String, u64>,
    /// Mode after the last window.
    pub final_mode: Mode,
    /// Evaluation of the last window.
    pub last: Option<Evaluation>,
    /// Hash of the last trace line.
    pub trace_last_hash: String,
}

/// Evaluate recorded telemetry window by window, never touching a cluster.
///
/// Each window becomes one trace line. The summary is written to
/// [`EVAL_SUMMARY_FILE`] in the output directory.
pub fn run_eval(config: &AgentConfig, ingested: &Ingested, window: usize, stride: usize) -> Result<EvalSummary> {
    let evaluator = Evaluator::from_config(config)?;
    let mut state = DecisionState::from_config(config)?;
    let out_dir = config.out_dir();
    let mut trace = DecisionTraceWriter::open(&out_dir.join(TRACE_FILE))?;

    let windows = sliding_windows(&ingested.samples, window, stride);
    info!(
        samples = ingested.samples.len(),
        dropped = ingested.stats.dropped_total(),
        windows = windows.len(),
        "evaluating recorded telemetry"
    );

    let mut digests = Vec::with_capacity(windows.len());
    let mut blocked_reasons: BTreeMap<String, u64> = BTreeMap::new();
    let mut last = None;
    let mut clock = 0;
    for (tick, samples) in (1u64..).zip(windows) {
        clock = window_clock(samples, clock);
        let evaluation = evaluator.evaluate(&mut state, samples, clock);
        let event = DecisionTraceEvent::from_evaluation(tick, clock, &evaluation, None);
        trace.append(&event)?;
        for (reason, count) in &event.blocked_reasons {
            *blocked_reasons.entry(reason.clone()).or_default() += count;
        }
        digests.push(WindowDigest {
            tick,
            ts_ms: clock,
            mode: evaluation.mode(),
            chord: evaluation.chord.clone(),
            actions: evaluation.actions.len(),
            allowed: evaluation.allowed_actions().count(),
        });
        last = Some(evaluation);
    }

    let summary = EvalSummary {
        schema_version: EVAL_SUMMARY_SCHEMA_VERSION.to_string(),
        ingest: ingested.stats,
        policy: evaluator.policy().name().to_string(),
        windows: digests,
        blocked_reasons,
        final_mode: state.mode(),
        last,
        trace_last_hash: trace.last_hash(),
    };
    write_report(&out_dir.join(EVAL_SUMMARY_FILE), &summary)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_newest() {
        let mut samples: Vec<TelemetrySample> =
            (0..5).map(|i| TelemetrySample::with_latency(i, 1.0)).collect();
        keep_newest(&mut samples, 3);
        assert_eq!(samples.iter().map(|s| s.ts_ms).collect::<Vec<_>>(), vec![2, 3, 4]);
        keep_newest(&mut samples, 0);
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_missing_file_is_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonlFileSource::new(dir.path().join("absent.jsonl"));
        let window = source.next_window(16).unwrap();
        assert!(window.samples.is_empty());
    }

    #[test]
    fn test_file_source_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"ts\":1,\"latency_ms\":10}\nnot json\n").unwrap();
        let mut source = JsonlFileSource::new(&path);
        let first = source.next_window(16).unwrap();
        assert_eq!(first.samples.len(), 1);
        assert_eq!(first.stats.dropped_invalid_json, 1);

        std::fs::write(&path, "{\"ts\":1,\"latency_ms\":10}\n{\"ts\":2,\"latency_ms\":10}\n").unwrap();
        assert_eq!(source.next_window(16).unwrap().samples.len(), 2);
    }
}
