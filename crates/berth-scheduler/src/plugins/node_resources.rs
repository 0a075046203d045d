use crate::cache::NodeInfo;
use crate::framework::{CycleState, FilterPlugin, Plugin, PreFilterPlugin, Status};
use berth_core::{pod_requests, Pod, ResourceQuantities};
use std::sync::Arc;
use tracing::debug;

const STATE_KEY: &str = "PreFilterNodeResourcesFit";

/// Checks that a node has room for the pod's CPU, memory and pod slot
#[derive(Debug, Default)]
pub struct NodeResourcesFit;

impl NodeResourcesFit {
    pub const NAME: &'static str = "NodeResourcesFit";
}

impl Plugin for NodeResourcesFit {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_pre_filter(self: Arc<Self>) -> Option<Arc<dyn PreFilterPlugin>> {
        Some(self)
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
}

impl PreFilterPlugin for NodeResourcesFit {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod) -> Status {
        state.write(STATE_KEY, pod_requests(pod));
        Status::success()
    }
}

impl FilterPlugin for NodeResourcesFit {
    fn filter(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let requests = match state.read::<ResourceQuantities>(STATE_KEY) {
            Some(requests) => requests.clone(),
            None => pod_requests(pod),
        };
        let allocatable = node_info.allocatable();
        let requested = node_info.requested();

        debug!(
            "Node {} has {} milli CPU and {} bytes memory free",
            node_info.node_name().unwrap_or("unknown"),
            allocatable.cpu_millicores - requested.cpu_millicores,
            allocatable.memory_bytes - requested.memory_bytes
        );

        let mut reasons = Vec::new();
        // A node that does not report pod slots is not limited by them
        if allocatable.pods > 0 && requested.pods + 1 > allocatable.pods {
            reasons.push("Too many pods".to_string());
        }
        if requests.cpu_millicores > 0
            && requests.cpu_millicores > allocatable.cpu_millicores - requested.cpu_millicores
        {
            reasons.push("Insufficient cpu".to_string());
        }
        if requests.memory_bytes > 0
            && requests.memory_bytes > allocatable.memory_bytes - requested.memory_bytes
        {
            reasons.push("Insufficient memory".to_string());
        }

        if reasons.is_empty() {
            Status::success()
        } else {
            let mut status = Status::unschedulable(reasons.remove(0));
            for reason in reasons {
                status = status.with_reason(reason);
            }
            status
        }
    }
}
