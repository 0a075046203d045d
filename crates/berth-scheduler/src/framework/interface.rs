use crate::cache::NodeInfo;
use crate::types::QueuedPodInfo;
use async_trait::async_trait;
use berth_core::Pod;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome code of a plugin call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Success,
    /// Internal failure; the pod is retried but the cause is not the pod's fit
    Error,
    /// The pod does not fit, but might after the cluster changes
    Unschedulable,
    /// The pod does not fit and nothing short of changing the pod will help
    UnschedulableAndUnresolvable,
    /// Permit only: hold the pod until allowed, rejected or timed out
    Wait,
    /// Bind only: this plugin declines to bind the pod
    Skip,
}

/// Result of running a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    reasons: Vec<String>,
}

impl Status {
    /// Create a status with a code and a single reason
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reasons: vec![reason.into()],
        }
    }

    pub fn success() -> Self {
        Self {
            code: Code::Success,
            reasons: Vec::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Code::Error, reason)
    }

    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Self::new(Code::Unschedulable, reason)
    }

    pub fn unresolvable(reason: impl Into<String>) -> Self {
        Self::new(Code::UnschedulableAndUnresolvable, reason)
    }

    pub fn wait() -> Self {
        Self {
            code: Code::Wait,
            reasons: Vec::new(),
        }
    }

    pub fn skip() -> Self {
        Self {
            code: Code::Skip,
            reasons: Vec::new(),
        }
    }

    /// Append another reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self.code,
            Code::Unschedulable | Code::UnschedulableAndUnresolvable
        )
    }

    /// All reasons joined into one line
    pub fn message(&self) -> String {
        self.reasons.join(", ")
    }

    /// Same code, message prefixed as `running <phase> plugin "<plugin>": <message>`
    pub fn with_plugin_context(&self, phase: &str, plugin: &str) -> Self {
        Self::new(
            self.code,
            format!("running {} plugin {:?}: {}", phase, plugin, self.message()),
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message())
    }
}

/// Per-cycle scratch space shared between the phases of one pod's cycle
#[derive(Default)]
pub struct CycleState {
    data: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous one
    pub fn write<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Box::new(value));
    }

    /// Read a value previously written under `key`
    pub fn read<T: Any>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

/// The phases a plugin can take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionPoint {
    QueueSort,
    PreFilter,
    Filter,
    Reserve,
    Permit,
    PreBind,
    Bind,
    PostBind,
}

impl ExtensionPoint {
    pub const ALL: [ExtensionPoint; 8] = [
        ExtensionPoint::QueueSort,
        ExtensionPoint::PreFilter,
        ExtensionPoint::Filter,
        ExtensionPoint::Reserve,
        ExtensionPoint::Permit,
        ExtensionPoint::PreBind,
        ExtensionPoint::Bind,
        ExtensionPoint::PostBind,
    ];
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A named extension. Each capability accessor hands back the plugin as the
/// matching phase trait object when the plugin implements that phase.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn as_queue_sort(self: Arc<Self>) -> Option<Arc<dyn QueueSortPlugin>> {
        None
    }

    fn as_pre_filter(self: Arc<Self>) -> Option<Arc<dyn PreFilterPlugin>> {
        None
    }

    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        None
    }

    fn as_reserve(self: Arc<Self>) -> Option<Arc<dyn ReservePlugin>> {
        None
    }

    fn as_permit(self: Arc<Self>) -> Option<Arc<dyn PermitPlugin>> {
        None
    }

    fn as_pre_bind(self: Arc<Self>) -> Option<Arc<dyn PreBindPlugin>> {
        None
    }

    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        None
    }

    fn as_post_bind(self: Arc<Self>) -> Option<Arc<dyn PostBindPlugin>> {
        None
    }
}

/// Orders the pending queue
pub trait QueueSortPlugin: Plugin {
    /// Whether `a` should be popped before `b`
    fn less(&self, a: &QueuedPodInfo, b: &QueuedPodInfo) -> bool;
}

/// Runs once per cycle before filtering
pub trait PreFilterPlugin: Plugin {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod) -> Status;
}

/// Decides whether a pod can run on a node
pub trait FilterPlugin: Plugin {
    fn filter(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status;
}

/// Claims per-node state once a node is chosen; `unreserve` undoes it
#[async_trait]
pub trait ReservePlugin: Plugin {
    async fn reserve(&self, state: &mut CycleState, pod: &Pod, node_name: &str) -> Status;

    async fn unreserve(&self, _state: &mut CycleState, _pod: &Pod, _node_name: &str) {}
}

/// Approves, denies or delays binding. A `Wait` status must come with a timeout.
#[async_trait]
pub trait PermitPlugin: Plugin {
    async fn permit(&self, state: &CycleState, pod: &Pod, node_name: &str) -> (Status, Duration);
}

/// Last step that may fail before the binding exists
#[async_trait]
pub trait PreBindPlugin: Plugin {
    async fn pre_bind(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;
}

/// Creates the binding; return `Status::skip()` to leave it to the next binder
#[async_trait]
pub trait BindPlugin: Plugin {
    async fn bind(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;
}

/// Informational hook after a successful bind
#[async_trait]
pub trait PostBindPlugin: Plugin {
    async fn post_bind(&self, state: &CycleState, pod: &Pod, node_name: &str);
}
