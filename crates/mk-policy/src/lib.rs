//! ModeKeeper Policy Engine
//!
//! Proposes bounded knob changes for a tick.
//!
//! # Core Concepts
//!
//! - [`PolicyStrategy`]: the `propose` contract shared by every policy
//! - [`ChordPolicy`]: one catalog chord per tick, expanded into knob targets
//! - [`ScalarPolicy`]: single-level comparison baseline
//! - [`Policy`]: the closed set of variants, chosen by [`PolicyConfig`]
//! - [`BatchInvariant`]: keeps `microbatch_size × grad_accum_steps` in band
//!
//! Policies are pure: the same [`PolicyInput`] always yields the same actions.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod action;
pub mod chord;
pub mod error;
pub mod invariant;
pub mod knobs;
pub mod policy;
pub mod scalar;
pub mod strategy;

pub use action::ProposedAction;
pub use chord::{signal_holds, trigger_signals, ChordPolicy, RECOVER_SIGNAL};
pub use error::PolicyError;
pub use invariant::{BatchInvariant, BatchPair};
pub use knobs::{default_registry, KnobSpec, KnobState};
pub use policy::{Policy, PolicyConfig, PolicyKind};
pub use scalar::{ScalarPolicy, SCALAR_CHORD_ID};
pub use strategy::{PolicyInput, PolicyStrategy};
