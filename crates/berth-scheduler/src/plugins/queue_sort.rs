use crate::framework::{Plugin, QueueSortPlugin};
use crate::types::QueuedPodInfo;
use berth_core::Pod;
use std::sync::Arc;

/// Orders pods by `spec.priority`, highest first, then by enqueue time
#[derive(Debug, Default)]
pub struct PrioritySort;

impl PrioritySort {
    pub const NAME: &'static str = "PrioritySort";
}

fn priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

impl Plugin for PrioritySort {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_queue_sort(self: Arc<Self>) -> Option<Arc<dyn QueueSortPlugin>> {
        Some(self)
    }
}

impl QueueSortPlugin for PrioritySort {
    fn less(&self, a: &QueuedPodInfo, b: &QueuedPodInfo) -> bool {
        let (pa, pb) = (priority(&a.pod), priority(&b.pod));
        pa > pb || (pa == pb && a.timestamp < b.timestamp)
    }
}
