//! K8s patch plans.
//!
//! Allowed actions become merge patches that write each knob as a
//! `modekeeper/knob.<knob>` annotation on the Deployment and on its pod
//! template. Actions for the same object coalesce into one item.
//!
//! A plan is all-or-nothing: one malformed item rejects the whole plan.

use mk_policy::ProposedAction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// `apiVersion` of every plan item.
pub const PLAN_API_VERSION: &str = "apps/v1";

/// `kind` of every plan item.
pub const PLAN_KIND: &str = "Deployment";

/// Annotation key prefix for knob values.
pub const KNOB_ANNOTATION_PREFIX: &str = "modekeeper/knob.";

/// Plan rejected as a whole.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Plan text is not JSON.
    #[error("plan is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level value is neither a list, an object, nor an `{items}` envelope.
    #[error("plan must be a list of items, a single item or an object with `items`")]
    NotAPlan,

    /// One item is malformed.
    #[error("item {index}: {reason}")]
    Item {
        /// Position in the plan.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The object the plan should target is incomplete.
    #[error("plan target: {0}")]
    Target(String),
}

/// Object a plan is built for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanTarget {
    /// Namespace of the Deployment.
    pub namespace: String,
    /// Deployment name.
    pub name: String,
}

impl PlanTarget {
    /// Create a target.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// One patch against one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Always `apps/v1`.
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Deployment`.
    pub kind: String,
    /// Target namespace.
    pub namespace: String,
    /// Target name.
    pub name: String,
    /// Why the object is patched.
    pub reason: String,
    /// JSON merge patch.
    pub patch: Value,
}

impl PlanItem {
    /// `deployment/<name>`, as the cluster CLI expects it.
    #[must_use]
    pub fn object_ref(&self) -> String {
        format!("{}/{}", self.kind.to_lowercase(), self.name)
    }

    fn empty(target: &PlanTarget) -> Self {
        Self {
            api_version: PLAN_API_VERSION.to_string(),
            kind: PLAN_KIND.to_string(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            reason: "coalesced".to_string(),
            patch: json!({
                "metadata": {"annotations": {}},
                "spec": {"template": {"metadata": {"annotations": {}}}},
            }),
        }
    }

    fn annotate(&mut self, knob: &str, target: i64) {
        let key = format!("{KNOB_ANNOTATION_PREFIX}{knob}");
        let value = Value::String(target.to_string());
        for pointer in ["/metadata/annotations", "/spec/template/metadata/annotations"] {
            if let Some(Value::Object(annotations)) = self.patch.pointer_mut(pointer) {
                annotations.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Ordered list of plan items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sPlan {
    items: Vec<PlanItem>,
}

impl K8sPlan {
    /// Plan items.
    #[inline]
    #[must_use]
    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    /// Number of items.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the plan changes nothing.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build a plan from allowed actions against one target.
    pub fn build<'a, I>(actions: I, target: &PlanTarget) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = &'a ProposedAction>,
    {
        if target.namespace.trim().is_empty() {
            return Err(PlanError::Target("namespace is empty".to_string()));
        }
        if target.name.trim().is_empty() {
            return Err(PlanError::Target("deployment name is empty".to_string()));
        }

        let mut item: Option<PlanItem> = None;
        for action in actions {
            item.get_or_insert_with(|| PlanItem::empty(target))
                .annotate(&action.knob, action.target);
        }
        Ok(Self {
            items: item.into_iter().collect(),
        })
    }

    /// Parse plan JSON: a list, a single item, or `{"items": [...]}`.
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Validate an already decoded plan.
    pub fn from_value(value: &Value) -> Result<Self, PlanError> {
        let raw_items: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => match map.get("items") {
                Some(Value::Array(items)) => items.iter().collect(),
                Some(_) => return Err(PlanError::NotAPlan),
                None => vec![value],
            },
            _ => return Err(PlanError::NotAPlan),
        };

        let items = raw_items
            .into_iter()
            .enumerate()
            .map(|(index, raw)| parse_item(raw).map_err(|reason| PlanError::Item { index, reason }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { items })
    }
}

fn parse_item(raw: &Value) -> Result<PlanItem, String> {
    let map: &Map<String, Value> = raw.as_object().ok_or("item must be an object")?;
    let text = |key: &str| -> Result<Option<String>, String> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(_) => Err(format!("{key} must be a string")),
        }
    };

    let namespace = text("namespace")?
        .filter(|s| !s.is_empty())
        .ok_or("namespace is required")?;
    let name = text("name")?.filter(|s| !s.is_empty()).ok_or("name is required")?;
    let patch = match map.get("patch") {
        Some(patch @ Value::Object(_)) => patch.clone(),
        Some(_) => return Err("patch must be an object".to_string()),
        None => return Err("patch is required".to_string()),
    };

    Ok(PlanItem {
        api_version: text("apiVersion")?.unwrap_or_else(|| PLAN_API_VERSION.to_string()),
        kind: text("kind")?.unwrap_or_else(|| PLAN_KIND.to_string()),
        namespace,
        name,
        reason: text("reason")?.unwrap_or_default(),
        patch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_coalesces_and_annotates_both_places() {
        let actions = [
            ProposedAction::new("grad_accum_steps", 8, "drift_detected", "DRIFT-RETUNE"),
            ProposedAction::new("microbatch_size", 16, "drift_detected", "DRIFT-RETUNE"),
        ];
        let plan = K8sPlan::build(&actions, &PlanTarget::new("ml", "trainer")).unwrap();
        assert_eq!(plan.len(), 1);
        let item = &plan.items()[0];
        assert_eq!(item.object_ref(), "deployment/trainer");
        assert_eq!(
            item.patch["metadata"]["annotations"]["modekeeper/knob.grad_accum_steps"],
            "8"
        );
        assert_eq!(
            item.patch["spec"]["template"]["metadata"]["annotations"]["modekeeper/knob.microbatch_size"],
            "16"
        );
    }

    #[test]
    fn test_build_targets_configured_object_once() {
        let actions = [
            ProposedAction::new("timeout_ms", 15_000, "latency_burst", "BURST-ABSORB"),
            ProposedAction::new("dataloader_num_workers", 6, "straggler_detected", "INPUT-STRAGGLER"),
            ProposedAction::new("timeout_ms", 20_000, "latency_burst", "BURST-ABSORB"),
        ];
        let plan = K8sPlan::build(&actions, &PlanTarget::new("ml", "trainer")).unwrap();
        assert_eq!(plan.len(), 1);
        let item = &plan.items()[0];
        assert_eq!((item.namespace.as_str(), item.name.as_str()), ("ml", "trainer"));
        let annotations = item.patch["metadata"]["annotations"].as_object().unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations["modekeeper/knob.timeout_ms"], "20000");
    }

    #[test]
    fn test_no_actions_no_items() {
        let plan = K8sPlan::build(std::iter::empty(), &PlanTarget::new("ml", "trainer")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_parse_shapes() {
        let item = json!({"namespace": "ml", "name": "t", "patch": {}});
        assert_eq!(K8sPlan::from_value(&item).unwrap().len(), 1);
        assert_eq!(K8sPlan::from_value(&json!([item, item])).unwrap().len(), 2);
        assert_eq!(K8sPlan::from_value(&json!({"items": [item]})).unwrap().len(), 1);
        assert!(matches!(K8sPlan::from_value(&json!(3)), Err(PlanError::NotAPlan)));
    }

    #[test]
    fn test_one_bad_item_rejects_plan() {
        let plan = json!([
            {"namespace": "ml", "name": "a", "patch": {}},
            {"namespace": "ml", "name": "b", "patch": "x"},
        ]);
        let err = K8sPlan::from_value(&plan).unwrap_err();
        assert!(matches!(err, PlanError::Item { index: 1, .. }));

        let missing = json!([{"name": "a", "patch": {}}]);
        assert!(matches!(
            K8sPlan::from_value(&missing),
            Err(PlanError::Item { index: 0, .. })
        ));
    }
}
