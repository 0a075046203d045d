use super::interface::Status;
use berth_core::{pod_key, Pod};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on any Permit wait
pub const MAX_PERMIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A pod held at Permit until every waiting plugin allows it
pub struct WaitingPod {
    pod: Pod,
    pending: Mutex<HashMap<String, Duration>>,
    sender: Mutex<Option<oneshot::Sender<Status>>>,
    receiver: Mutex<Option<oneshot::Receiver<Status>>>,
    timers: CancellationToken,
}

impl WaitingPod {
    /// Create a waiting pod and arm one timer per waiting plugin.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(pod: Pod, plugin_timeouts: HashMap<String, Duration>) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        let waiting = Arc::new(Self {
            pod,
            pending: Mutex::new(plugin_timeouts.clone()),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            timers: CancellationToken::new(),
        });

        for (plugin, timeout) in plugin_timeouts {
            let weak = Arc::downgrade(&waiting);
            let token = waiting.timers.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(waiting) = weak.upgrade() {
                            waiting.reject(
                                &plugin,
                                format!("rejected due to timeout after waiting {:?}", timeout),
                            );
                        }
                    }
                }
            });
        }

        waiting
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    /// Names of the plugins that have not allowed the pod yet
    pub fn pending_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record approval from one plugin; the pod is released once none remain
    pub fn allow(&self, plugin: &str) {
        let released = {
            let mut pending = self.pending.lock();
            pending.remove(plugin);
            pending.is_empty()
        };
        if released {
            self.resolve(Status::success());
        }
    }

    /// Deny the pod on behalf of a plugin
    pub fn reject(&self, plugin: &str, message: impl Into<String>) {
        self.resolve(Status::unschedulable(message).with_plugin_context("Permit", plugin));
    }

    /// Deny the pod for a reason outside any plugin (e.g. the pod was deleted)
    pub fn cancel(&self, message: impl Into<String>) {
        self.resolve(Status::unschedulable(message));
    }

    fn resolve(&self, status: Status) {
        if let Some(tx) = self.sender.lock().take() {
            self.timers.cancel();
            // The receiver may already be gone if the binding cycle was aborted
            let _ = tx.send(status);
        }
    }

    /// Wait for the verdict. Only the first caller receives it.
    pub(crate) async fn wait(&self) -> Status {
        let rx = self.receiver.lock().take();
        match rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Status::error("waiting pod was dropped before a verdict")),
            None => Status::error("permit verdict already consumed"),
        }
    }
}

/// Pods currently waiting at Permit, keyed by pod key
#[derive(Default)]
pub struct WaitingPods {
    pods: Mutex<HashMap<String, Arc<WaitingPod>>>,
}

impl WaitingPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, waiting: Arc<WaitingPod>) {
        let key = pod_key(waiting.pod());
        debug!("Pod {} is waiting on permit", key);
        self.pods.lock().insert(key, waiting);
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<WaitingPod>> {
        self.pods.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<WaitingPod>> {
        self.pods.lock().get(key).cloned()
    }

    /// Keys of all waiting pods
    pub fn keys(&self) -> Vec<String> {
        self.pods.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pods.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.lock().is_empty()
    }

    /// Cancel a waiting pod; returns whether one was found
    pub fn cancel(&self, key: &str, message: &str) -> bool {
        match self.get(key) {
            Some(waiting) => {
                waiting.cancel(message);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Code;

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod
    }

    fn timeouts(entries: &[(&str, u64)]) -> HashMap<String, Duration> {
        entries
            .iter()
            .map(|(name, secs)| (name.to_string(), Duration::from_secs(*secs)))
            .collect()
    }

    #[tokio::test]
    async fn test_allowed_by_all_plugins() {
        let waiting = WaitingPod::new(pod("p"), timeouts(&[("A", 60), ("B", 60)]));
        waiting.allow("A");
        assert_eq!(waiting.pending_plugins(), vec!["B".to_string()]);
        waiting.allow("B");

        assert!(waiting.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_reject_names_plugin() {
        let waiting = WaitingPod::new(pod("p"), timeouts(&[("Gate", 60)]));
        waiting.reject("Gate", "not today");

        let status = waiting.wait().await;
        assert_eq!(status.code(), Code::Unschedulable);
        assert_eq!(status.message(), r#"running Permit plugin "Gate": not today"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects() {
        let waiting = WaitingPod::new(pod("p"), timeouts(&[("Slow", 5)]));

        let status = waiting.wait().await;
        assert_eq!(status.code(), Code::Unschedulable);
        assert!(status.message().contains("timeout"));
        assert!(status.message().contains("Slow"));
    }

    #[tokio::test]
    async fn test_first_verdict_wins() {
        let waiting = WaitingPod::new(pod("p"), timeouts(&[("A", 60)]));
        waiting.allow("A");
        waiting.reject("A", "too late");

        assert!(waiting.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_registry_cancel() {
        let pods = WaitingPods::new();
        let waiting = WaitingPod::new(pod("p"), timeouts(&[("A", 60)]));
        pods.add(waiting.clone());

        assert_eq!(pods.keys(), vec!["default/p".to_string()]);
        assert!(pods.cancel("default/p", "pod deleted"));
        assert!(!pods.cancel("default/missing", "pod deleted"));
        assert_eq!(waiting.wait().await.message(), "pod deleted");

        pods.remove("default/p");
        assert!(pods.is_empty());
    }
}
