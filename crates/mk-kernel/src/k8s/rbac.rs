//! Decoding of RBAC `Forbidden` errors.
//!
//! Turns kubectl error text into the missing permission so that an
//! `rbac_denied` blocker says exactly which rule to grant.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FORBIDDEN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r#"(?i)User\s+"(?P<user>[^"]+)"\s+cannot\s+(?P<verb>[a-z]+)\s+resource\s+"(?P<resource>[^"]+)"\s+in\s+API\s+group\s+"(?P<group>[^"]*)"\s+(?:in\s+the\s+namespace\s+"(?P<namespace>[^"]+)"|at\s+the\s+cluster\s+scope)"#,
    )
    .ok()
});

static OBJECT_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)"(?P<name>[^"]+)"\s+is forbidden:"#).ok());

/// Where the missing permission applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbacScope {
    /// Role in one namespace.
    Namespaced,
    /// Cluster-wide role.
    Cluster,
}

/// RBAC rule that would have allowed the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedRule {
    /// API groups (`""` is core).
    pub api_groups: Vec<String>,
    /// Resources.
    pub resources: Vec<String>,
    /// Verbs.
    pub verbs: Vec<String>,
}

/// Structured form of a `Forbidden` error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacDenial {
    /// Denied subject.
    pub user: String,
    /// Denied verb, lower-case.
    pub verb: String,
    /// Resource, e.g. `deployments`.
    pub resource: String,
    /// API group, e.g. `apps`.
    pub api_group: String,
    /// Namespace, for namespaced denials.
    pub namespace: Option<String>,
    /// Object name, when the error names one.
    pub name: Option<String>,
    /// Role or cluster role.
    pub scope: RbacScope,
    /// Rule to grant.
    pub suggested_rule: SuggestedRule,
    /// One-line remediation.
    pub hint: String,
}

/// Decode the first `Forbidden` error in `text`.
#[must_use]
pub fn parse_forbidden(text: &str) -> Option<RbacDenial> {
    let raw = text.trim();
    let lower = raw.to_lowercase();
    if !lower.contains("forbidden") || !lower.contains("cannot") {
        return None;
    }

    let caps = FORBIDDEN.as_ref()?.captures(raw)?;
    let user = caps.name("user")?.as_str().to_string();
    let verb = caps.name("verb")?.as_str().to_lowercase();
    let resource = caps.name("resource")?.as_str().to_string();
    let api_group = caps.name("group").map_or("", |m| m.as_str()).to_string();
    let namespace = caps.name("namespace").map(|m| m.as_str().to_string());
    let scope = if namespace.is_some() {
        RbacScope::Namespaced
    } else {
        RbacScope::Cluster
    };
    let name = OBJECT_NAME
        .as_ref()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.name("name"))
        .map(|m| m.as_str().to_string());

    let suggested_rule = SuggestedRule {
        api_groups: vec![api_group.clone()],
        resources: vec![resource.clone()],
        verbs: vec![verb.clone()],
    };
    let hint = hint(&user, &suggested_rule, namespace.as_deref(), name.as_deref());

    Some(RbacDenial {
        user,
        verb,
        resource,
        api_group,
        namespace,
        name,
        scope,
        suggested_rule,
        hint,
    })
}

fn hint(user: &str, rule: &SuggestedRule, namespace: Option<&str>, name: Option<&str>) -> String {
    let (role, binding) = match namespace {
        Some(ns) => (format!("Role in namespace \"{ns}\""), "RoleBinding"),
        None => ("ClusterRole".to_string(), "ClusterRoleBinding"),
    };
    let list = |items: &[String]| {
        items
            .iter()
            .map(|i| format!("\"{i}\""))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut hint = format!(
        "Grant a {role} rule with apiGroups=[{}], resources=[{}], verbs=[{}]; then bind it to user \"{user}\" using {binding}.",
        list(&rule.api_groups),
        list(&rule.resources),
        list(&rule.verbs),
    );
    if let Some(name) = name {
        hint.push_str(&format!(
            " Optionally add resourceNames=[\"{name}\"] for least privilege."
        ));
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_denial() {
        let text = "Error from server (Forbidden): deployments.apps \"trainer\" is forbidden: \
                    User \"system:serviceaccount:ml:mk\" cannot patch resource \"deployments\" \
                    in API group \"apps\" in the namespace \"ml\"";
        let denial = parse_forbidden(text).unwrap();
        assert_eq!(denial.verb, "patch");
        assert_eq!(denial.resource, "deployments");
        assert_eq!(denial.api_group, "apps");
        assert_eq!(denial.namespace.as_deref(), Some("ml"));
        assert_eq!(denial.name.as_deref(), Some("trainer"));
        assert_eq!(denial.scope, RbacScope::Namespaced);
        assert!(denial.hint.contains("RoleBinding"));
        assert!(denial.hint.contains("resourceNames=[\"trainer\"]"));
    }

    #[test]
    fn test_cluster_scope_denial() {
        let text = "Error from server (Forbidden): namespaces is forbidden: User \"dev\" cannot \
                    list resource \"namespaces\" in API group \"\" at the cluster scope";
        let denial = parse_forbidden(text).unwrap();
        assert_eq!(denial.scope, RbacScope::Cluster);
        assert_eq!(denial.api_group, "");
        assert!(denial.namespace.is_none());
        assert!(denial.hint.starts_with("Grant a ClusterRole rule"));
    }

    #[test]
    fn test_other_errors_are_not_denials() {
        assert!(parse_forbidden("").is_none());
        assert!(parse_forbidden("Error from server (NotFound): deployments.apps \"x\" not found").is_none());
        assert!(parse_forbidden("forbidden but unparseable, cannot tell").is_none());
    }
}
