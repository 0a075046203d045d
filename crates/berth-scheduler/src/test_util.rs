//! Builders and fakes shared by the unit tests

use crate::cache::NodeInfo;
use crate::client::InMemoryCluster;
use crate::framework::*;
use async_trait::async_trait;
use berth_core::{Node, Pod};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, NodeSpec, NodeStatus, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub fn create_test_node(name: &str, cpu: &str, memory: &str) -> Node {
    let mut allocatable = BTreeMap::new();
    allocatable.insert("cpu".to_string(), Quantity(cpu.to_string()));
    allocatable.insert("memory".to_string(), Quantity(memory.to_string()));
    allocatable.insert("pods".to_string(), Quantity("110".to_string()));

    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.spec = Some(NodeSpec::default());
    node.status = Some(NodeStatus {
        allocatable: Some(allocatable.clone()),
        capacity: Some(allocatable),
        ..Default::default()
    });
    node
}

pub fn create_test_pod(name: &str, namespace: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.uid = Some(format!("{}-uid", name));
    pod.spec = Some(PodSpec {
        containers: vec![Container {
            name: "app".to_string(),
            image: Some("nginx:latest".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

pub fn with_requests(mut pod: Pod, cpu: &str, memory: &str) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
    requests.insert("memory".to_string(), Quantity(memory.to_string()));
    if let Some(container) = pod.spec.as_mut().and_then(|s| s.containers.first_mut()) {
        container.resources = Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        });
    }
    pod
}

pub fn with_host_port(mut pod: Pod, port: i32) -> Pod {
    if let Some(container) = pod.spec.as_mut().and_then(|s| s.containers.first_mut()) {
        container
            .ports
            .get_or_insert_with(Vec::new)
            .push(ContainerPort {
                container_port: port,
                host_port: Some(port),
                ..Default::default()
            });
    }
    pod
}

pub fn with_scheduler_name(mut pod: Pod, scheduler_name: &str) -> Pod {
    pod.spec.get_or_insert_with(Default::default).scheduler_name = Some(scheduler_name.to_string());
    pod
}

pub fn assign(mut pod: Pod, node: &str) -> Pod {
    pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
    pod
}

/// A framework handle backed by a fresh in-memory cluster
pub fn test_handle() -> (FrameworkHandle, Arc<InMemoryCluster>) {
    let cluster = Arc::new(InMemoryCluster::default());
    let handle = FrameworkHandle::new(cluster.clone(), Arc::new(WaitingPods::new()));
    (handle, cluster)
}

type FilterFn = Arc<dyn Fn(&Pod, &NodeInfo) -> Status + Send + Sync>;
type ReserveHook = Arc<dyn Fn(&Pod, &str) + Send + Sync>;

/// Configurable plugin. It only claims the extension points it was given
/// behavior for; all clones share their call counters.
#[derive(Clone)]
pub struct FakePlugin {
    name: String,
    filter: Option<FilterFn>,
    reserve: Option<Status>,
    reserve_hook: Option<ReserveHook>,
    permit: Option<(Status, Duration)>,
    pre_bind: Option<Status>,
    bind: Option<Status>,
    post_bind: bool,
    reserve_calls: Arc<Mutex<Vec<String>>>,
    unreserve_calls: Arc<Mutex<usize>>,
    post_bind_calls: Arc<Mutex<Vec<String>>>,
}

impl FakePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            filter: None,
            reserve: None,
            reserve_hook: None,
            permit: None,
            pre_bind: None,
            bind: None,
            post_bind: false,
            reserve_calls: Arc::new(Mutex::new(Vec::new())),
            unreserve_calls: Arc::new(Mutex::new(0)),
            post_bind_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `hook` with the pod and node on every Reserve call
    pub fn on_reserve(mut self, hook: impl Fn(&Pod, &str) + Send + Sync + 'static) -> Self {
        self.reserve_hook = Some(Arc::new(hook));
        self
    }

    pub fn filter_with(
        mut self,
        f: impl Fn(&Pod, &NodeInfo) -> Status + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Filter that only lets pods onto the named node
    pub fn only_node(self, node: &str) -> Self {
        let node = node.to_string();
        self.filter_with(move |_, info| {
            if info.node_name() == Some(node.as_str()) {
                Status::success()
            } else {
                Status::unschedulable(format!("node(s) didn't match {}", node))
            }
        })
    }

    pub fn reserve_status(mut self, status: Status) -> Self {
        self.reserve = Some(status);
        self
    }

    pub fn permit_status(mut self, status: Status, timeout: Duration) -> Self {
        self.permit = Some((status, timeout));
        self
    }

    pub fn pre_bind_status(mut self, status: Status) -> Self {
        self.pre_bind = Some(status);
        self
    }

    pub fn bind_status(mut self, status: Status) -> Self {
        self.bind = Some(status);
        self
    }

    pub fn observe_post_bind(mut self) -> Self {
        self.post_bind = true;
        self
    }

    /// Pod names seen by Reserve
    pub fn reserve_calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.reserve_calls.clone()
    }

    pub fn unreserve_calls(&self) -> Arc<Mutex<usize>> {
        self.unreserve_calls.clone()
    }

    /// `pod@node` entries seen by PostBind
    pub fn post_bind_calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.post_bind_calls.clone()
    }
}

pub fn fake_plugin_factory(plugin: FakePlugin) -> PluginFactory {
    Arc::new(move |_: Option<&serde_json::Value>, _: &FrameworkHandle| Ok(Arc::new(plugin.clone()) as Arc<dyn Plugin>))
}

impl Plugin for FakePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        if self.filter.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_reserve(self: Arc<Self>) -> Option<Arc<dyn ReservePlugin>> {
        if self.reserve.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_permit(self: Arc<Self>) -> Option<Arc<dyn PermitPlugin>> {
        if self.permit.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_pre_bind(self: Arc<Self>) -> Option<Arc<dyn PreBindPlugin>> {
        if self.pre_bind.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        if self.bind.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_post_bind(self: Arc<Self>) -> Option<Arc<dyn PostBindPlugin>> {
        if self.post_bind {
            Some(self)
        } else {
            None
        }
    }
}

impl FilterPlugin for FakePlugin {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        match &self.filter {
            Some(f) => f(pod, node_info),
            None => Status::success(),
        }
    }
}

#[async_trait]
impl ReservePlugin for FakePlugin {
    async fn reserve(&self, _state: &mut CycleState, pod: &Pod, node_name: &str) -> Status {
        self.reserve_calls
            .lock()
            .push(pod.metadata.name.clone().unwrap_or_default());
        if let Some(hook) = &self.reserve_hook {
            hook(pod, node_name);
        }
        self.reserve.clone().unwrap_or_else(Status::success)
    }

    async fn unreserve(&self, _state: &mut CycleState, _pod: &Pod, _node_name: &str) {
        *self.unreserve_calls.lock() += 1;
    }
}

#[async_trait]
impl PermitPlugin for FakePlugin {
    async fn permit(&self, _state: &CycleState, _pod: &Pod, _node_name: &str) -> (Status, Duration) {
        self.permit
            .clone()
            .unwrap_or_else(|| (Status::success(), Duration::ZERO))
    }
}

#[async_trait]
impl PreBindPlugin for FakePlugin {
    async fn pre_bind(&self, _state: &CycleState, _pod: &Pod, _node_name: &str) -> Status {
        self.pre_bind.clone().unwrap_or_else(Status::success)
    }
}

#[async_trait]
impl BindPlugin for FakePlugin {
    async fn bind(&self, _state: &CycleState, _pod: &Pod, _node_name: &str) -> Status {
        self.bind.clone().unwrap_or_else(Status::skip)
    }
}

#[async_trait]
impl PostBindPlugin for FakePlugin {
    async fn post_bind(&self, _state: &CycleState, pod: &Pod, node_name: &str) {
        self.post_bind_calls.lock().push(format!(
            "{}@{}",
            pod.metadata.name.as_deref().unwrap_or(""),
            node_name
        ));
    }
}
