use crate::cache::NodeInfo;
use crate::framework::{CycleState, FilterPlugin, Plugin, PreFilterPlugin, Status};
use berth_core::{host_ports, HostPort, Pod};
use std::sync::Arc;

const STATE_KEY: &str = "PreFilterNodePorts";

pub const ERR_REASON_PORTS: &str = "node(s) didn't have free ports for the requested pod ports";

/// Rejects nodes where a requested host port is already taken
#[derive(Debug, Default)]
pub struct NodePorts;

impl NodePorts {
    pub const NAME: &'static str = "NodePorts";
}

impl Plugin for NodePorts {
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

impl PreFilterPlugin for NodePorts {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod) -> Status {
        state.write(STATE_KEY, host_ports(pod));
        Status::success()
    }
}

impl FilterPlugin for NodePorts {
    fn filter(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let computed;
        let wanted: &[HostPort] = match state.read::<Vec<HostPort>>(STATE_KEY) {
            Some(ports) => ports,
            None => {
                computed = host_ports(pod);
                &computed
            }
        };

        let conflict = wanted
            .iter()
            .any(|want| node_info.used_ports().iter().any(|used| want.conflicts_with(used)));
        if conflict {
            Status::unschedulable(ERR_REASON_PORTS)
        } else {
            Status::success()
        }
    }
}
