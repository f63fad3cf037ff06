//! Non-mutating verification of a K8s plan.
//!
//! For each plan item, in order:
//! 1. the namespace exists
//! 2. the Deployment exists
//! 3. `auth can-i patch` allows the patch
//! 4. a server-side dry run of the patch succeeds
//!
//! Every object is checked independently. A failing object does not stop
//! its siblings from being checked and reported.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::accessor::{args, run_folded, ClusterAccessor, CommandOutput};
use super::plan::{K8sPlan, PlanItem};
use super::rbac::{parse_forbidden, RbacDenial};

/// Schema of the serialized [`VerifyReport`].
pub const VERIFY_SCHEMA_VERSION: &str = "k8s_verify.v0";

/// Why verification did not pass.
///
/// Declaration order is the selection order when several objects fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyBlockerKind {
    /// The cluster CLI binary is missing.
    KubectlMissing,
    /// Target namespace does not exist.
    NamespaceMissing,
    /// Target Deployment does not exist.
    DeploymentMissing,
    /// Permission to patch is denied.
    RbacDenied,
    /// Dry run failed for another reason.
    DryRunFailed,
}

impl VerifyBlockerKind {
    /// Wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            VerifyBlockerKind::KubectlMissing => "kubectl_missing",
            VerifyBlockerKind::NamespaceMissing => "namespace_missing",
            VerifyBlockerKind::DeploymentMissing => "deployment_missing",
            VerifyBlockerKind::RbacDenied => "rbac_denied",
            VerifyBlockerKind::DryRunFailed => "dry_run_failed",
        }
    }
}

impl fmt::Display for VerifyBlockerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocker of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyBlocker {
    /// Blocker code.
    pub kind: VerifyBlockerKind,
    /// Index of the object in the plan, when object specific.
    pub index: Option<usize>,
    /// Short `rc=...; stderr=...` summary.
    pub detail: Option<String>,
    /// Decoded permission error, for `rbac_denied`.
    pub rbac: Option<RbacDenial>,
}

/// Server-side dry run outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRun {
    /// Whether the dry run was issued.
    pub attempted: bool,
    /// Exit status 0.
    pub ok: bool,
    /// Exit status, if the process exited.
    pub exit_code: Option<i32>,
    /// Trimmed stderr.
    pub stderr: Option<String>,
}

/// Checks of one plan item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCheck {
    /// Position in the plan.
    pub index: usize,
    /// Namespace checked.
    pub namespace: String,
    /// Deployment checked.
    pub name: String,
    /// `get namespace/<ns>` succeeded.
    pub namespace_exists: bool,
    /// `get deployment/<name>` succeeded.
    pub deployment_exists: bool,
    /// `auth can-i patch` answer, when it could be read.
    pub can_patch: Option<bool>,
    /// Dry run outcome.
    pub dry_run: DryRun,
    /// First failing check.
    pub blocker: Option<VerifyBlocker>,
}

impl ObjectCheck {
    fn new(index: usize, item: &PlanItem) -> Self {
        Self {
            index,
            namespace: item.namespace.clone(),
            name: item.name.clone(),
            namespace_exists: false,
            deployment_exists: false,
            can_patch: None,
            dry_run: DryRun::default(),
            blocker: None,
        }
    }

    /// Whether every check passed.
    #[inline]
    #[must_use]
    pub fn ok(&self) -> bool {
        self.blocker.is_none()
    }
}

/// Verification of a whole plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Always `k8s_verify.v0`.
    pub schema_version: String,
    /// Every object passed.
    pub ok: bool,
    /// The cluster CLI could be run.
    pub kubectl_present: bool,
    /// Per-object checks, in plan order.
    pub objects: Vec<ObjectCheck>,
    /// Reported blocker for the whole plan.
    pub blocker: Option<VerifyBlocker>,
}

impl VerifyReport {
    fn new(kubectl_present: bool, objects: Vec<ObjectCheck>) -> Self {
        let blocker = if kubectl_present {
            objects
                .iter()
                .filter_map(|o| o.blocker.as_ref())
                .min_by_key(|b| (b.kind, b.index))
                .cloned()
        } else {
            Some(VerifyBlocker {
                kind: VerifyBlockerKind::KubectlMissing,
                index: None,
                detail: None,
                rbac: None,
            })
        };
        Self {
            schema_version: VERIFY_SCHEMA_VERSION.to_string(),
            ok: blocker.is_none(),
            kubectl_present,
            objects,
            blocker,
        }
    }

    /// Blocker code of the whole plan.
    #[must_use]
    pub fn blocker_kind(&self) -> Option<VerifyBlockerKind> {
        self.blocker.as_ref().map(|b| b.kind)
    }
}

/// Runs the verification checks through a [`ClusterAccessor`].
#[derive(Debug)]
pub struct PlanVerifier<'a, A: ClusterAccessor + ?Sized> {
    accessor: &'a A,
}

impl<'a, A: ClusterAccessor + ?Sized> PlanVerifier<'a, A> {
    /// Create a verifier.
    #[must_use]
    pub fn new(accessor: &'a A) -> Self {
        Self { accessor }
    }

    /// Verify every plan item.
    ///
    /// Objects are checked one after another, never concurrently.
    pub async fn verify(&self, plan: &K8sPlan) -> VerifyReport {
        let mut objects = Vec::with_capacity(plan.len());
        for (index, item) in plan.items().iter().enumerate() {
            match self.check(index, item).await {
                Some(check) => objects.push(check),
                None => {
                    // No CLI: nothing else can be checked.
                    let mut rest: Vec<ObjectCheck> = plan.items()[index..]
                        .iter()
                        .enumerate()
                        .map(|(offset, item)| {
                            let mut check = ObjectCheck::new(index + offset, item);
                            check.dry_run.stderr = Some("kubectl not found".to_string());
                            check.blocker = Some(VerifyBlocker {
                                kind: VerifyBlockerKind::KubectlMissing,
                                index: Some(index + offset),
                                detail: None,
                                rbac: None,
                            });
                            check
                        })
                        .collect();
                    objects.append(&mut rest);
                    let report = VerifyReport::new(false, objects);
                    warn!(blocker = "kubectl_missing", "verify failed");
                    return report;
                }
            }
        }

        let report = VerifyReport::new(true, objects);
        match report.blocker.as_ref() {
            None => info!(objects = report.objects.len(), "verify ok"),
            Some(blocker) => warn!(
                blocker = %blocker.kind,
                index = ?blocker.index,
                "verify failed"
            ),
        }
        report
    }

    /// Check one object. `None` means the CLI is missing.
    async fn check(&self, index: usize, item: &PlanItem) -> Option<ObjectCheck> {
        let mut check = ObjectCheck::new(index, item);
        let ns = item.namespace.as_str();
        let object = item.object_ref();

        let namespace = run_folded(
            self.accessor,
            &args(&["get", &format!("namespace/{ns}"), "-o", "name"]),
        )
        .await?;
        check.namespace_exists = namespace.success();

        let deployment = run_folded(self.accessor, &args(&["-n", ns, "get", &object, "-o", "name"])).await?;
        check.deployment_exists = deployment.success();

        let can_i = run_folded(self.accessor, &args(&["-n", ns, "auth", "can-i", "patch", &object])).await?;
        check.can_patch = parse_can_i(&can_i);

        if check.namespace_exists && check.deployment_exists {
            let patch = item.patch.to_string();
            let dry = run_folded(
                self.accessor,
                &args(&[
                    "-n",
                    ns,
                    "patch",
                    &object,
                    "--type",
                    "merge",
                    "--dry-run=server",
                    "-o",
                    "name",
                    "-p",
                    &patch,
                ]),
            )
            .await?;
            let stderr = dry.stderr.trim();
            check.dry_run = DryRun {
                attempted: true,
                ok: dry.success(),
                exit_code: dry.exit_code,
                stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
            };
        }

        check.blocker = select_blocker(&check, &can_i);
        Some(check)
    }
}

fn select_blocker(check: &ObjectCheck, can_i: &CommandOutput) -> Option<VerifyBlocker> {
    let blocker = |kind, detail, rbac| {
        Some(VerifyBlocker {
            kind,
            index: Some(check.index),
            detail,
            rbac,
        })
    };

    if !check.namespace_exists {
        return blocker(VerifyBlockerKind::NamespaceMissing, None, None);
    }
    if !check.deployment_exists {
        return blocker(VerifyBlockerKind::DeploymentMissing, None, None);
    }
    if check.can_patch == Some(false) {
        let texts = [check.dry_run.stderr.as_deref().unwrap_or_default(), can_i.stderr.as_str()];
        let rbac = texts.iter().find_map(|t| parse_forbidden(t));
        return blocker(VerifyBlockerKind::RbacDenied, None, rbac);
    }
    if check.dry_run.attempted && !check.dry_run.ok {
        let stderr = check.dry_run.stderr.as_deref().unwrap_or_default();
        let kind = classify_dry_run_failure(stderr);
        let rbac = if kind == VerifyBlockerKind::RbacDenied {
            parse_forbidden(stderr)
        } else {
            None
        };
        return blocker(kind, summarize(check.dry_run.exit_code, stderr), rbac);
    }
    None
}

/// Map dry-run stderr to a blocker.
#[must_use]
pub fn classify_dry_run_failure(stderr: &str) -> VerifyBlockerKind {
    let lower = stderr.trim().to_lowercase();
    if lower.contains("forbidden") || lower.contains("cannot patch") {
        return VerifyBlockerKind::RbacDenied;
    }
    if lower.contains("notfound") || lower.contains("not found") {
        if lower.contains("namespace") {
            return VerifyBlockerKind::NamespaceMissing;
        }
        return VerifyBlockerKind::DeploymentMissing;
    }
    VerifyBlockerKind::DryRunFailed
}

/// Read a yes/no answer from `auth can-i`.
fn parse_can_i(output: &CommandOutput) -> Option<bool> {
    let answer = output.stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    match answer.to_lowercase().as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

fn summarize(exit_code: Option<i32>, stderr: &str) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(rc) = exit_code {
        parts.push(format!("rc={rc}"));
    }
    let text = stderr.trim();
    if !text.is_empty() {
        if text.chars().count() > 160 {
            let head: String = text.chars().take(157).collect();
            parts.push(format!("stderr={head}..."));
        } else {
            parts.push(format!("stderr={text}"));
        }
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}
