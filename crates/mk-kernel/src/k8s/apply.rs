//! Mutating patch calls.
//!
//! Only reached after the apply gate chain passed. Each object is patched
//! independently; a failure is recorded and the next object is still tried.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::accessor::{args, run_folded, ClusterAccessor};
use super::plan::K8sPlan;
use super::rbac::{parse_forbidden, RbacDenial};

/// Lines of stderr kept per object.
pub const SNIP_MAX_LINES: usize = 12;

/// Characters of stderr kept per object.
pub const SNIP_MAX_CHARS: usize = 500;

/// Outcome of patching one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectApply {
    /// Position in the plan.
    pub index: usize,
    /// Namespace patched.
    pub namespace: String,
    /// Deployment patched.
    pub name: String,
    /// Patch call succeeded.
    pub ok: bool,
    /// Exit status, if the process exited.
    pub exit_code: Option<i32>,
    /// Truncated stderr.
    pub stderr: Option<String>,
    /// Decoded permission error.
    pub rbac: Option<RbacDenial>,
}

/// Outcome of patching a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Every attempted object succeeded.
    pub ok: bool,
    /// Per-object outcomes, in plan order.
    pub objects: Vec<ObjectApply>,
}

/// Issues merge patches through a [`ClusterAccessor`].
#[derive(Debug)]
pub struct PlanApplier<'a, A: ClusterAccessor + ?Sized> {
    accessor: &'a A,
}

impl<'a, A: ClusterAccessor + ?Sized> PlanApplier<'a, A> {
    /// Create an applier.
    #[must_use]
    pub fn new(accessor: &'a A) -> Self {
        Self { accessor }
    }

    /// Patch every plan item in order.
    pub async fn apply(&self, plan: &K8sPlan) -> ApplyReport {
        let mut objects = Vec::with_capacity(plan.len());
        for (index, item) in plan.items().iter().enumerate() {
            let patch = item.patch.to_string();
            let object = item.object_ref();
            let call = args(&[
                "-n",
                &item.namespace,
                "patch",
                &object,
                "--type",
                "merge",
                "-o",
                "name",
                "-p",
                &patch,
            ]);

            let outcome = match run_folded(self.accessor, &call).await {
                Some(output) => {
                    let stderr = snip_text(&output.stderr);
                    ObjectApply {
                        index,
                        namespace: item.namespace.clone(),
                        name: item.name.clone(),
                        ok: output.success(),
                        exit_code: output.exit_code,
                        rbac: parse_forbidden(&output.stderr),
                        stderr: (!stderr.is_empty()).then_some(stderr),
                    }
                }
                None => ObjectApply {
                    index,
                    namespace: item.namespace.clone(),
                    name: item.name.clone(),
                    ok: false,
                    exit_code: None,
                    stderr: Some("kubectl not found".to_string()),
                    rbac: None,
                },
            };

            if outcome.ok {
                info!(namespace = %outcome.namespace, name = %outcome.name, "patch applied");
            } else {
                warn!(
                    namespace = %outcome.namespace,
                    name = %outcome.name,
                    exit_code = ?outcome.exit_code,
                    "patch failed"
                );
            }
            objects.push(outcome);
        }

        ApplyReport {
            ok: objects.iter().all(|o| o.ok),
            objects,
        }
    }
}

/// Bound captured output to [`SNIP_MAX_LINES`] lines and [`SNIP_MAX_CHARS`]
/// characters, marking truncation.
#[must_use]
pub fn snip_text(text: &str) -> String {
    let value = text.trim();
    if value.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = value.lines().collect();
    let by_lines = lines.len() > SNIP_MAX_LINES;
    let mut clipped = lines[..lines.len().min(SNIP_MAX_LINES)].join("\n");

    let by_chars = clipped.chars().count() > SNIP_MAX_CHARS;
    if by_chars {
        clipped = clipped.chars().take(SNIP_MAX_CHARS - 3).collect();
        clipped.push_str("...");
    }
    if by_lines || by_chars {
        clipped.push_str("\n...(truncated)");
    }
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snip_short_text_untouched() {
        assert_eq!(snip_text("  error: boom \n"), "error: boom");
        assert_eq!(snip_text("   "), "");
    }

    #[test]
    fn test_snip_by_lines() {
        let text = (0..20).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let snipped = snip_text(&text);
        assert!(snipped.ends_with("\n...(truncated)"));
        assert!(snipped.contains("line 11"));
        assert!(!snipped.contains("line 12"));
    }

    #[test]
    fn test_snip_by_chars() {
        let snipped = snip_text(&"é".repeat(900));
        let body = snipped.trim_end_matches("\n...(truncated)");
        assert_eq!(body.chars().count(), SNIP_MAX_CHARS);
        assert!(body.ends_with("..."));
    }
}
