//! Kubernetes plan building, verification and apply.
//!
//! - **plan**: allowed actions to Deployment merge patches
//! - **accessor**: the opaque command executor every cluster call goes through
//! - **verify**: namespace / object / permission / dry-run checks
//! - **apply**: the mutating patch calls
//! - **rbac**: `Forbidden` error decoding

pub mod accessor;
pub mod apply;
pub mod plan;
pub mod rbac;
pub mod verify;

pub use accessor::{current_context, AccessError, ClusterAccessor, ClusterConfig, CommandOutput, Kubectl};
pub use apply::{snip_text, ApplyReport, ObjectApply, PlanApplier};
pub use plan::{K8sPlan, PlanError, PlanItem, PlanTarget, KNOB_ANNOTATION_PREFIX};
pub use rbac::{parse_forbidden, RbacDenial, RbacScope, SuggestedRule};
pub use verify::{
    classify_dry_run_failure, DryRun, ObjectCheck, PlanVerifier, VerifyBlocker, VerifyBlockerKind,
    VerifyReport, VERIFY_SCHEMA_VERSION,
};
