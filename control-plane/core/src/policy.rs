use crate::{Labels, PolicyError, ResourceId, Selector};
use serde::{Deserialize, Serialize};

/// A connectivity policy allowing or denying connections between workloads.
///
/// Privileged policies are cluster-scoped and take precedence over regular,
/// namespaced policies. A regular policy only applies to connections decided in
/// its own namespace.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessPolicy {
    #[serde(flatten)]
    pub id: ResourceId,

    #[serde(default)]
    pub privileged: bool,

    pub action: PolicyAction,

    pub from: Vec<WorkloadSetOrSelector>,

    pub to: Vec<WorkloadSetOrSelector>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// Selects workloads either by a named workload set or by labels. Exactly one
/// must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSetOrSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workload_sets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<Selector>,
}

// === impl AccessPolicy ===

impl AccessPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| PolicyError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.from.is_empty() {
            return Err(invalid("empty from field".to_string()));
        }
        if self.to.is_empty() {
            return Err(invalid("empty to field".to_string()));
        }
        for wss in self.from.iter().chain(&self.to) {
            wss.validate().map_err(invalid)?;
        }
        Ok(())
    }

    /// True if `src` is selected by some `from` entry and `dst` by some `to`
    /// entry.
    pub fn matches(&self, src: &Labels, dst: &Labels) -> bool {
        self.from.iter().any(|wss| wss.matches(src)) && self.to.iter().any(|wss| wss.matches(dst))
    }
}

// === impl PolicyAction ===

impl std::str::FromStr for PolicyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            s => Err(format!("unsupported policy action: {s}")),
        }
    }
}

// === impl WorkloadSetOrSelector ===

impl WorkloadSetOrSelector {
    pub fn selector(selector: Selector) -> Self {
        Self {
            workload_sets: vec![],
            workload_selector: Some(selector),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match (&self.workload_selector, self.workload_sets.is_empty()) {
            (Some(_), false) => {
                Err("workload sets and a workload selector cannot both be set".to_string())
            }
            (None, true) => {
                Err("one of workload sets or workload selector must be set".to_string())
            }
            (None, false) => Err("workload sets are not supported".to_string()),
            (Some(selector), true) => selector.validate(),
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        self.workload_selector
            .as_ref()
            .map(|s| s.matches(labels))
            .unwrap_or(false)
    }
}
