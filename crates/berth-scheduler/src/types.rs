use crate::framework::Status;
use berth_core::{pod_key, Binding, Pod};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::time::Instant;

/// Upper bound on the aggregated fit failure message
pub const MAX_FIT_ERROR_MESSAGE_LEN: usize = 150;

/// A pod plus queuing metadata
#[derive(Debug, Clone)]
pub struct QueuedPodInfo {
    /// Pod to be scheduled
    pub pod: Pod,
    /// When the pod was last added to the queue
    pub timestamp: Instant,
    /// When the pod was first added to the queue
    pub initial_attempt_timestamp: Instant,
    /// Number of scheduling attempts so far
    pub attempts: u32,
}

impl QueuedPodInfo {
    /// Wrap a freshly enqueued pod
    pub fn new(pod: Pod) -> Self {
        let now = Instant::now();
        Self {
            pod,
            timestamp: now,
            initial_attempt_timestamp: now,
            attempts: 0,
        }
    }

    /// Queue key of the wrapped pod
    pub fn key(&self) -> String {
        pod_key(&self.pod)
    }
}

/// Outcome of a successful scheduling algorithm run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    /// Name of the selected node
    pub suggested_host: String,
    /// Number of nodes the algorithm evaluated
    pub evaluated_nodes: usize,
    /// Number of nodes that passed filtering
    pub feasible_nodes: usize,
}

/// Why no node was chosen for a pod
#[derive(Debug, Clone)]
pub struct FitError {
    /// The pod that did not fit
    pub pod: Pod,
    /// Number of nodes in the snapshot
    pub num_all_nodes: usize,
    /// Per-node failure status
    pub filtered_nodes_statuses: HashMap<String, Status>,
}

impl FitError {
    /// Failure reasons folded into `<count> <reason>` entries, sorted
    pub fn aggregated_reasons(&self) -> Vec<String> {
        let mut histogram: BTreeMap<&str, usize> = BTreeMap::new();
        for status in self.filtered_nodes_statuses.values() {
            for reason in status.reasons() {
                *histogram.entry(reason.as_str()).or_default() += 1;
            }
        }

        let mut reasons: Vec<String> = histogram
            .into_iter()
            .map(|(reason, count)| format!("{} {}", count, reason))
            .collect();
        reasons.sort();
        reasons
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = format!(
            "0/{} nodes are available: {}.",
            self.num_all_nodes,
            self.aggregated_reasons().join(", ")
        );
        f.write_str(&truncate_message(message, MAX_FIT_ERROR_MESSAGE_LEN))
    }
}

/// Cut a message to at most `max` characters, marking the cut with "..."
pub(crate) fn truncate_message(message: String, max: usize) -> String {
    if message.chars().count() <= max {
        return message;
    }
    let keep = max.saturating_sub(3);
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// Build the Binding artifact for a pod and its chosen node
pub fn new_binding(pod: &Pod, node_name: &str) -> Binding {
    Binding {
        metadata: ObjectMeta {
            name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
            uid: pod.metadata.uid.clone(),
            ..Default::default()
        },
        target: ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node_name.to_string()),
            ..Default::default()
        },
    }
}
