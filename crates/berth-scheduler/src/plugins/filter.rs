use crate::cache::NodeInfo;
use crate::framework::{CycleState, FilterPlugin, Plugin, Status};
use berth_core::Pod;
use k8s_openapi::api::core::v1::{Taint, Toleration};
use std::sync::Arc;

pub const ERR_REASON_SELECTOR: &str = "node(s) didn't match node selector";
pub const ERR_REASON_UNSCHEDULABLE: &str = "node(s) were unschedulable";
pub const ERR_REASON_TAINTS: &str = "node(s) had taints that the pod didn't tolerate";

const TAINT_NODE_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";

/// Requires every `spec.nodeSelector` entry to match a node label
#[derive(Debug, Default)]
pub struct NodeSelector;

impl NodeSelector {
    pub const NAME: &'static str = "NodeSelector";
}

impl Plugin for NodeSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
}

impl FilterPlugin for NodeSelector {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let selector = match pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) {
            Some(selector) => selector,
            None => return Status::success(),
        };
        let labels = node_info.node().and_then(|n| n.metadata.labels.as_ref());

        let matches = selector
            .iter()
            .all(|(key, value)| labels.and_then(|l| l.get(key)) == Some(value));
        if matches {
            Status::success()
        } else {
            Status::unresolvable(ERR_REASON_SELECTOR)
        }
    }
}

/// Rejects cordoned nodes unless the pod tolerates the unschedulable taint
#[derive(Debug, Default)]
pub struct NodeUnschedulable;

impl NodeUnschedulable {
    pub const NAME: &'static str = "NodeUnschedulable";
}

impl Plugin for NodeUnschedulable {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
}

impl FilterPlugin for NodeUnschedulable {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let cordoned = node_info
            .node()
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if !cordoned {
            return Status::success();
        }

        let taint = Taint {
            key: TAINT_NODE_UNSCHEDULABLE.to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        };
        if tolerations(pod).iter().any(|t| tolerates(t, &taint)) {
            Status::success()
        } else {
            Status::unresolvable(ERR_REASON_UNSCHEDULABLE)
        }
    }
}

/// Rejects nodes with NoSchedule/NoExecute taints the pod does not tolerate
#[derive(Debug, Default)]
pub struct TaintToleration;

impl TaintToleration {
    pub const NAME: &'static str = "TaintToleration";
}

impl Plugin for TaintToleration {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
}

impl FilterPlugin for TaintToleration {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let taints = node_info
            .node()
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.taints.as_deref())
            .unwrap_or(&[]);
        let pod_tolerations = tolerations(pod);

        let untolerated = taints
            .iter()
            .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
            .any(|taint| !pod_tolerations.iter().any(|t| tolerates(t, taint)));
        if untolerated {
            Status::unresolvable(ERR_REASON_TAINTS)
        } else {
            Status::success()
        }
    }
}

fn tolerations(pod: &Pod) -> &[Toleration] {
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or(&[])
}

/// Toleration matching: an empty key with `Exists` matches every taint, an
/// empty effect matches every effect, `Equal` (the default) compares values
fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }

    let key = toleration.key.as_deref().unwrap_or("");
    let exists = toleration.operator.as_deref() == Some("Exists");
    if key.is_empty() {
        return exists;
    }
    if key != taint.key {
        return false;
    }
    if exists {
        return true;
    }
    toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or("")
}
