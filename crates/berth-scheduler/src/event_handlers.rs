use crate::cache::SchedulerCache;
use crate::error::Result;
use crate::framework::WaitingPods;
use crate::profile::ProfileMap;
use crate::queue::SchedulingQueue;
use berth_core::{
    is_assigned, is_terminating, pod_key, Node, Pod, ResourceEvent, WatchEventType,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps the queue and the node cache in step with the workload store
///
/// Unassigned pods owned by one of our profiles are queued; assigned pods and
/// nodes go to the cache. Events are applied idempotently since delivery is
/// at-least-once.
pub struct EventHandlers {
    cache: Arc<SchedulerCache>,
    queue: Arc<SchedulingQueue>,
    profiles: Arc<ProfileMap>,
    waiting_pods: Arc<WaitingPods>,
}

impl EventHandlers {
    pub fn new(
        cache: Arc<SchedulerCache>,
        queue: Arc<SchedulingQueue>,
        profiles: Arc<ProfileMap>,
        waiting_pods: Arc<WaitingPods>,
    ) -> Self {
        Self {
            cache,
            queue,
            profiles,
            waiting_pods,
        }
    }

    /// Apply one watch event
    pub fn handle(&self, event: &ResourceEvent) -> Result<()> {
        match event.resource_key.gvk.kind.as_str() {
            "Pod" => self.handle_pod(event),
            "Node" => self.handle_node(event),
            other => {
                debug!("Ignoring {:?} event for kind {}", event.event_type, other);
                Ok(())
            }
        }
    }

    fn handle_pod(&self, event: &ResourceEvent) -> Result<()> {
        let pod: Pod = event.decode()?;
        let key = pod_key(&pod);

        if event.event_type == WatchEventType::Deleted {
            debug!("Pod {} deleted", key);
            self.queue.delete(&key);
            if self.waiting_pods.cancel(&key, "pod was deleted") {
                info!("Rejected waiting pod {} after deletion", key);
            }
            return self.cache.remove_pod(&pod);
        }

        if is_assigned(&pod) {
            self.queue.delete(&key);
            return match self.cache.get_pod(&key) {
                Some(_) if !self.cache.is_assumed_pod(&pod) => self.cache.update_pod(&pod),
                _ => self.cache.add_pod(&pod),
            };
        }

        if !self.profiles.handles_pod(&pod) {
            return Ok(());
        }
        if is_terminating(&pod) {
            self.queue.delete(&key);
            return Ok(());
        }

        let old: Option<Pod> = event.decode_old()?;
        if let Some(old) = old {
            if only_status_changed(&old, &pod) {
                debug!("Skipping status-only update of pod {}", key);
                return Ok(());
            }
        }
        self.queue.add(pod);
        Ok(())
    }

    fn handle_node(&self, event: &ResourceEvent) -> Result<()> {
        match event.event_type {
            WatchEventType::Added => {
                let node: Node = event.decode()?;
                self.cache.add_node(&node)
            }
            WatchEventType::Modified => {
                let node: Node = event.decode()?;
                self.cache.update_node(&node)
            }
            WatchEventType::Deleted => self.cache.remove_node(&event.resource_key.name),
        }
    }

    /// Apply events from `rx` until cancelled or the bus closes
    pub async fn run(self, rx: broadcast::Receiver<ResourceEvent>, token: CancellationToken) {
        let mut stream = BroadcastStream::new(rx);
        info!("Starting watch sync");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => {
                    info!("Watch sync shutting down");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if let Err(e) = self.handle(&event) {
                        warn!("Failed to apply event for {}: {}", event.resource_key, e);
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!("Watch sync lagged behind, skipped {} events", skipped);
                }
                None => {
                    info!("Watch bus closed, stopping watch sync");
                    return;
                }
            }
        }
    }
}

/// Updates the scheduler itself causes (condition and nominated node patches)
/// don't make a pending pod more schedulable
fn only_status_changed(old: &Pod, new: &Pod) -> bool {
    old.spec == new.spec
        && old.metadata.labels == new.metadata.labels
        && old.metadata.annotations == new.metadata.annotations
        && old.metadata.deletion_timestamp == new.metadata.deletion_timestamp
}
