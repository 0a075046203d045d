use crate::client::ClusterClient;
use crate::framework::{BindPlugin, CycleState, Plugin, Status};
use crate::types::new_binding;
use async_trait::async_trait;
use berth_core::{pod_key, Pod};
use std::sync::Arc;
use tracing::debug;

/// Binds pods by creating a Binding in the workload store
pub struct DefaultBinder {
    client: Arc<dyn ClusterClient>,
}

impl DefaultBinder {
    pub const NAME: &'static str = "DefaultBinder";

    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

impl Plugin for DefaultBinder {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        Some(self)
    }
}

#[async_trait]
impl BindPlugin for DefaultBinder {
    async fn bind(&self, _state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        debug!("Attempting to bind {} to {}", pod_key(pod), node_name);
        match self.client.create_binding(&new_binding(pod, node_name)).await {
            Ok(()) => Status::success(),
            Err(e) => Status::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryCluster;
    use crate::framework::Code;
    use crate::test_util::create_test_pod;

    #[tokio::test]
    async fn test_binds_through_client() {
        let cluster = Arc::new(InMemoryCluster::default());
        let pod = create_test_pod("foo", "default");
        cluster.add_pod(pod.clone()).await;

        let binder = DefaultBinder::new(cluster.clone());
        let status = binder.bind(&CycleState::new(), &pod, "machine1").await;
        assert!(status.is_success());

        let bindings = cluster.bindings().await;
        assert_eq!(bindings[0].target.name.as_deref(), Some("machine1"));
    }

    #[tokio::test]
    async fn test_client_failure_is_an_error_status() {
        let cluster = Arc::new(InMemoryCluster::default());
        let pod = create_test_pod("foo", "default");

        let binder = DefaultBinder::new(cluster);
        let status = binder.bind(&CycleState::new(), &pod, "machine1").await;
        assert_eq!(status.code(), Code::Error);
        assert!(status.message().contains("not found"));
    }
}
