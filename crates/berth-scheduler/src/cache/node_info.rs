use berth_core::{host_ports, pod_key, pod_requests, HostPort, Node, Pod, ResourceQuantities};

/// Aggregated view of one node and the pods placed on it
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    node: Option<Node>,
    pods: Vec<Pod>,
    requested: ResourceQuantities,
    allocatable: ResourceQuantities,
    used_ports: Vec<HostPort>,
    generation: u64,
}

/// Allocatable resources of a node, falling back to capacity
fn node_allocatable(node: &Node) -> ResourceQuantities {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref().or(s.capacity.as_ref()))
        .map(ResourceQuantities::from_k8s_resource_map)
        .unwrap_or_default()
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        let mut info = Self::default();
        info.set_node(node);
        info
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node.as_ref().and_then(|n| n.metadata.name.as_deref())
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    /// Sum of the requests of every pod on the node, `pods` counting one per pod
    pub fn requested(&self) -> &ResourceQuantities {
        &self.requested
    }

    pub fn allocatable(&self) -> &ResourceQuantities {
        &self.allocatable
    }

    pub fn used_ports(&self) -> &[HostPort] {
        &self.used_ports
    }

    /// Bumped on every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_node(&mut self, node: Node) {
        self.allocatable = node_allocatable(&node);
        self.node = Some(node);
        self.generation += 1;
    }

    pub(crate) fn clear_node(&mut self) {
        self.node = None;
        self.allocatable = ResourceQuantities::default();
        self.generation += 1;
    }

    pub fn has_pod(&self, key: &str) -> bool {
        self.pods.iter().any(|p| pod_key(p) == key)
    }

    pub(crate) fn add_pod(&mut self, pod: Pod) {
        let mut requests = pod_requests(&pod);
        requests.pods = 1;
        self.requested.add(&requests);
        self.used_ports.extend(host_ports(&pod));
        self.pods.push(pod);
        self.generation += 1;
    }

    /// Remove a pod by key, releasing its resources and ports
    pub(crate) fn remove_pod(&mut self, key: &str) -> bool {
        let position = match self.pods.iter().position(|p| pod_key(p) == key) {
            Some(position) => position,
            None => return false,
        };
        let pod = self.pods.swap_remove(position);

        let mut requests = pod_requests(&pod);
        requests.pods = 1;
        self.requested.sub(&requests);
        for port in host_ports(&pod) {
            if let Some(i) = self.used_ports.iter().position(|p| *p == port) {
                self.used_ports.swap_remove(i);
            }
        }
        self.generation += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{create_test_node, create_test_pod, with_host_port, with_requests};

    #[test]
    fn test_add_and_remove_pod_accounting() {
        let mut info = NodeInfo::new(create_test_node("machine1", "4", "8Gi"));
        assert_eq!(info.node_name(), Some("machine1"));
        assert_eq!(info.allocatable().cpu_millicores, 4000);

        let pod = with_host_port(with_requests(create_test_pod("foo", "default"), "1", "1Gi"), 8080);
        info.add_pod(pod);
        assert_eq!(info.requested().cpu_millicores, 1000);
        assert_eq!(info.requested().pods, 1);
        assert_eq!(info.used_ports().len(), 1);
        assert!(info.has_pod("default/foo"));

        let generation = info.generation();
        assert!(info.remove_pod("default/foo"));
        assert!(!info.remove_pod("default/foo"));
        assert_eq!(*info.requested(), ResourceQuantities::default());
        assert!(info.used_ports().is_empty());
        assert!(info.generation() > generation);
    }

    #[test]
    fn test_clear_node_keeps_pods() {
        let mut info = NodeInfo::new(create_test_node("machine1", "4", "8Gi"));
        info.add_pod(create_test_pod("foo", "default"));
        info.clear_node();

        assert!(info.node().is_none());
        assert_eq!(info.pods().len(), 1);
    }
}
