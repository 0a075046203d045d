pub mod interface;
pub mod registry;
pub mod runtime;
pub mod waiting_pods;

pub use interface::{
    BindPlugin, Code, CycleState, ExtensionPoint, FilterPlugin, PermitPlugin, Plugin,
    PostBindPlugin, PreBindPlugin, PreFilterPlugin, QueueSortPlugin, ReservePlugin, Status,
};
pub use registry::{PluginFactory, Registry};
pub use runtime::Framework;
pub use waiting_pods::{WaitingPod, WaitingPods, MAX_PERMIT_TIMEOUT};

use crate::client::ClusterClient;
use std::sync::Arc;

/// What a plugin may reach from inside the framework
#[derive(Clone)]
pub struct FrameworkHandle {
    client: Arc<dyn ClusterClient>,
    waiting_pods: Arc<WaitingPods>,
}

impl FrameworkHandle {
    pub fn new(client: Arc<dyn ClusterClient>, waiting_pods: Arc<WaitingPods>) -> Self {
        Self {
            client,
            waiting_pods,
        }
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    pub fn waiting_pods(&self) -> &Arc<WaitingPods> {
        &self.waiting_pods
    }
}
