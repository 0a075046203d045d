use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use berth_core::{node_name, pod_key, BerthError, Binding, Node, Pod, ResourceEvent};
use std::collections::BTreeMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

/// Default capacity of the watch broadcast channel
pub const DEFAULT_WATCH_CAPACITY: usize = 4096;

/// The calls the scheduler makes against the authoritative workload store
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Record a pod's node assignment
    async fn create_binding(&self, binding: &Binding) -> Result<()>;

    /// Apply a merge patch to a pod's status subresource
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Fetch the current version of a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// A status patch as received by the store
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    pub namespace: String,
    pub name: String,
    pub patch: serde_json::Value,
}

/// Workload store kept in memory
///
/// Stores nodes and pods, records every binding and status patch, and
/// publishes a `ResourceEvent` for each mutation so the scheduler can
/// follow it the same way it would follow a real watch.
pub struct InMemoryCluster {
    pods: RwLock<BTreeMap<String, Pod>>,
    nodes: RwLock<BTreeMap<String, Node>>,
    bindings: Mutex<Vec<Binding>>,
    patches: Mutex<Vec<PatchRequest>>,
    binding_failure: Mutex<Option<String>>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}

impl InMemoryCluster {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            pods: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            bindings: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
            binding_failure: Mutex::new(None),
            event_tx,
        }
    }

    /// Subscribe to resource events
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: berth_core::Result<ResourceEvent>) {
        match event {
            // No subscribers is fine
            Ok(event) => {
                let _ = self.event_tx.send(event);
            }
            Err(e) => warn!("Failed to build resource event: {}", e),
        }
    }

    pub async fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        let previous = self.nodes.write().await.insert(name, node.clone());
        match previous {
            Some(old) => self.publish(ResourceEvent::node_modified(&old, &node)),
            None => self.publish(ResourceEvent::node_added(&node)),
        }
    }

    pub async fn delete_node(&self, name: &str) -> Option<Node> {
        let removed = self.nodes.write().await.remove(name);
        if let Some(node) = &removed {
            self.publish(ResourceEvent::node_deleted(node));
        }
        removed
    }

    /// Create or replace a pod
    pub async fn add_pod(&self, pod: Pod) {
        let key = pod_key(&pod);
        let previous = self.pods.write().await.insert(key, pod.clone());
        match previous {
            Some(old) => self.publish(ResourceEvent::pod_modified(&old, &pod)),
            None => self.publish(ResourceEvent::pod_added(&pod)),
        }
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let key = format!("{}/{}", namespace, name);
        let removed = self.pods.write().await.remove(&key);
        if let Some(pod) = &removed {
            self.publish(ResourceEvent::pod_deleted(pod));
        }
        removed
    }

    pub async fn pods(&self) -> Vec<Pod> {
        self.pods.read().await.values().cloned().collect()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Every binding accepted so far
    pub async fn bindings(&self) -> Vec<Binding> {
        self.bindings.lock().await.clone()
    }

    /// Every status patch received so far
    pub async fn patch_requests(&self) -> Vec<PatchRequest> {
        self.patches.lock().await.clone()
    }

    /// Make every subsequent binding fail with `message`, or accept them again with `None`
    pub async fn fail_bindings_with(&self, message: Option<String>) {
        *self.binding_failure.lock().await = message;
    }
}

/// Merge a status patch into a pod. Conditions are merged by `type`; every
/// other field follows JSON merge-patch rules.
fn apply_status_patch(pod: &Pod, patch: &serde_json::Value) -> Result<Pod> {
    let mut pod_json = serde_json::to_value(pod).map_err(|e| {
        BerthError::serialization_error(format!("Failed to serialize pod: {}", e), Some(Box::new(e)))
    })?;

    let mut status_patch = patch
        .get("status")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let conditions = status_patch
        .as_object_mut()
        .and_then(|s| s.remove("conditions"));

    let status = &mut pod_json["status"];
    if status.is_null() {
        *status = serde_json::json!({});
    }
    json_patch::merge(&mut *status, &status_patch);

    if let Some(serde_json::Value::Array(patched)) = conditions {
        let current = &mut status["conditions"];
        if !current.is_array() {
            *current = serde_json::json!([]);
        }
        if let serde_json::Value::Array(current) = current {
            for condition in patched {
                let same_type = current
                    .iter()
                    .position(|c| c.get("type") == condition.get("type"));
                match same_type {
                    Some(i) => json_patch::merge(&mut current[i], &condition),
                    None => current.push(condition),
                }
            }
        }
    }

    serde_json::from_value(pod_json).map_err(|e| {
        BerthError::serialization_error(format!("Patched pod is invalid: {}", e), Some(Box::new(e)))
            .into()
    })
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create_binding(&self, binding: &Binding) -> Result<()> {
        if let Some(message) = self.binding_failure.lock().await.clone() {
            return Err(SchedulerError::client_error(message));
        }

        let namespace = binding.metadata.namespace.as_deref().unwrap_or("");
        let name = binding.metadata.name.as_deref().unwrap_or("");
        let key = format!("{}/{}", namespace, name);
        let target = binding
            .target
            .name
            .clone()
            .ok_or_else(|| SchedulerError::client_error("binding has no target node"))?;

        let (old, new) = {
            let mut pods = self.pods.write().await;
            let pod = pods
                .get_mut(&key)
                .ok_or_else(|| SchedulerError::client_error(format!("pod {} not found", key)))?;
            if let Some(current) = node_name(pod) {
                return Err(SchedulerError::client_error(format!(
                    "pod {} is already assigned to node {:?}",
                    key, current
                )));
            }
            let old = pod.clone();
            pod.spec.get_or_insert_with(Default::default).node_name = Some(target.clone());
            (old, pod.clone())
        };

        self.bindings.lock().await.push(binding.clone());
        debug!("Bound pod {} to node {}", key, target);
        self.publish(ResourceEvent::pod_modified(&old, &new));
        Ok(())
    }

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        self.patches.lock().await.push(PatchRequest {
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: patch.clone(),
        });

        let (old, new) = {
            let mut pods = self.pods.write().await;
            let pod = pods
                .get_mut(&key)
                .ok_or_else(|| SchedulerError::client_error(format!("pod {} not found", key)))?;
            let old = pod.clone();
            *pod = apply_status_patch(pod, patch)?;
            (old, pod.clone())
        };

        self.publish(ResourceEvent::pod_modified(&old, &new));
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let key = format!("{}/{}", namespace, name);
        Ok(self.pods.read().await.get(&key).cloned())
    }
}
