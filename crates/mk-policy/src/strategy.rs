//! Policy strategy trait.

use mk_catalog::ChordCatalog;
use mk_signals::{Mode, SignalSet};

use crate::action::ProposedAction;
use crate::knobs::KnobState;

/// Everything a policy may look at for one tick.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Confirmed mode after this window.
    pub mode: Mode,
    /// This window's signals.
    pub signals: &'a SignalSet,
    /// Validated chord catalog.
    pub catalog: &'a ChordCatalog,
    /// Knob values before this tick.
    pub knobs: &'a KnobState,
}

/// Turns a tick's inputs into proposed knob changes.
///
/// # Determinism
/// `propose` must be a pure function of its input. Replaying the same input
/// must yield the same actions in the same order.
pub trait PolicyStrategy: Send + Sync + std::fmt::Debug {
    /// Propose actions for one tick.
    fn propose(&self, input: &PolicyInput<'_>) -> Vec<ProposedAction>;

    /// Strategy name (for logs and reports)
    fn name(&self) -> &'static str;
}
