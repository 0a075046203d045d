pub mod quantities;

pub use quantities::ResourceQuantities;

use k8s_openapi::api::core::v1::Pod;

/// Scheduler name assumed for pods that do not declare one
pub const DEFAULT_SCHEDULER_NAME: &str = "default-scheduler";

/// Wildcard host IP; a port bound here conflicts with the same port on every IP
const WILDCARD_IP: &str = "0.0.0.0";

/// Stable identity of a pod inside the scheduler: `namespace/name`
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or(""),
        pod.metadata.name.as_deref().unwrap_or("")
    )
}

/// The scheduler name a pod asked for
pub fn scheduler_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.scheduler_name.as_deref())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SCHEDULER_NAME)
}

/// The node a pod is bound (or assumed) to, if any
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Whether the pod already carries a node assignment
pub fn is_assigned(pod: &Pod) -> bool {
    node_name(pod).is_some()
}

/// Whether the pod has been marked for deletion
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Total resources requested by a pod.
///
/// Regular containers are summed; init containers run one at a time, so the
/// effective request is the larger of the sum and the biggest init container.
pub fn pod_requests(pod: &Pod) -> ResourceQuantities {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return ResourceQuantities::default(),
    };

    let mut total = ResourceQuantities::default();
    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            total.add(&ResourceQuantities::from_k8s_resource_map(requests));
        }
    }

    for container in spec.init_containers.iter().flatten() {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            let init = ResourceQuantities::from_k8s_resource_map(requests);
            total.cpu_millicores = total.cpu_millicores.max(init.cpu_millicores);
            total.memory_bytes = total.memory_bytes.max(init.memory_bytes);
        }
    }

    total
}

/// A host port claimed by a container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub protocol: String,
    pub host_ip: String,
    pub port: i32,
}

impl HostPort {
    /// Two claims conflict when protocol and port match and either IP is the
    /// wildcard or both IPs are equal
    pub fn conflicts_with(&self, other: &HostPort) -> bool {
        self.protocol == other.protocol
            && self.port == other.port
            && (self.host_ip == other.host_ip
                || self.host_ip == WILDCARD_IP
                || other.host_ip == WILDCARD_IP)
    }
}

/// All host ports requested by a pod's containers
pub fn host_ports(pod: &Pod) -> Vec<HostPort> {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };

    spec.containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let port = p.host_port.filter(|port| *port > 0)?;
            Some(HostPort {
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                host_ip: p
                    .host_ip
                    .clone()
                    .filter(|ip| !ip.is_empty())
                    .unwrap_or_else(|| WILDCARD_IP.to_string()),
                port,
            })
        })
        .collect()
}
