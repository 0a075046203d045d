use crate::config::{validate_extenders, ExtenderConfig};
use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Legacy predicate names and the filter plugins they map to
const PREDICATE_PLUGINS: &[(&str, &[&str])] = &[
    ("PodFitsResources", &["NodeResourcesFit"]),
    ("PodFitsHostPorts", &["NodePorts"]),
    ("MatchNodeSelector", &["NodeSelector"]),
    ("PodToleratesNodeTaints", &["TaintToleration"]),
    ("CheckNodeUnschedulable", &["NodeUnschedulable"]),
    (
        "GeneralPredicates",
        &["NodeResourcesFit", "NodePorts", "NodeSelector"],
    ),
];

/// Legacy scheduling policy document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub predicates: Vec<PredicatePolicy>,
    #[serde(default)]
    pub priorities: Vec<PriorityPolicy>,
    #[serde(default)]
    pub extenders: Vec<ExtenderConfig>,
    #[serde(default)]
    pub always_check_all_predicates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicatePolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    pub name: String,
    pub weight: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<serde_json::Value>,
}

impl Policy {
    /// Parse and validate a policy from JSON or YAML text
    pub fn parse(data: &str) -> Result<Self> {
        let policy: Policy = berth_core::from_yaml(data)
            .map_err(|e| SchedulerError::invalid_policy(format!("failed to parse policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Read, parse and validate a policy file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading scheduling policy from {}", path.display());
        let data = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::invalid_policy(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(kind) = &self.kind {
            if kind != "Policy" {
                return Err(SchedulerError::invalid_policy(format!(
                    "expected kind Policy, got {}",
                    kind
                )));
            }
        }
        for predicate in &self.predicates {
            if plugins_for_predicate(&predicate.name).is_none() {
                return Err(SchedulerError::invalid_policy(format!(
                    "unknown predicate {:?}",
                    predicate.name
                )));
            }
        }
        for priority in &self.priorities {
            if priority.weight <= 0 {
                return Err(SchedulerError::invalid_policy(format!(
                    "priority {} should have a positive weight, got {}",
                    priority.name, priority.weight
                )));
            }
        }
        validate_extenders(&self.extenders)
            .map_err(|e| SchedulerError::invalid_policy(e.to_string()))?;

        if !self.priorities.is_empty() {
            debug!(
                "Policy declares {} priorities; selection does not score nodes",
                self.priorities.len()
            );
        }
        Ok(())
    }

    /// Filter plugins equivalent to the policy's predicates, in order and
    /// without duplicates
    pub fn to_filter_plugins(&self) -> Result<Vec<String>> {
        let mut plugins: Vec<String> = Vec::new();
        for predicate in &self.predicates {
            let mapped = plugins_for_predicate(&predicate.name).ok_or_else(|| {
                SchedulerError::invalid_policy(format!("unknown predicate {:?}", predicate.name))
            })?;
            for plugin in mapped {
                if !plugins.iter().any(|p| p == plugin) {
                    plugins.push(plugin.to_string());
                }
            }
        }
        Ok(plugins)
    }
}

fn plugins_for_predicate(name: &str) -> Option<&'static [&'static str]> {
    PREDICATE_PLUGINS
        .iter()
        .find(|(predicate, _)| *predicate == name)
        .map(|(_, plugins)| *plugins)
}
