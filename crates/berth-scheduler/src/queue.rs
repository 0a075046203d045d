use crate::framework::QueueSortPlugin;
use crate::types::QueuedPodInfo;
use berth_core::{pod_key, Pod};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_POD_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_POD_MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Default)]
struct QueueState {
    active: Vec<QueuedPodInfo>,
    in_flight: HashSet<String>,
    /// Updates that arrived while the pod was in flight
    parked: HashMap<String, QueuedPodInfo>,
    backing_off: HashMap<String, QueuedPodInfo>,
    closed: bool,
}

/// Pending pods waiting for a scheduling cycle
///
/// A pod is in at most one of active, backing off or in flight at a time,
/// so no pod ever has two cycles outstanding.
pub struct SchedulingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    sort: Option<Arc<dyn QueueSortPlugin>>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl SchedulingQueue {
    /// Create a queue ordered by `sort`, or FIFO without one
    pub fn new(
        sort: Option<Arc<dyn QueueSortPlugin>>,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            sort,
            initial_backoff,
            max_backoff,
        }
    }

    /// Add a pod, or refresh the queued copy of it
    pub fn add(&self, pod: Pod) {
        let key = pod_key(&pod);
        let mut state = self.state.lock();

        if state.in_flight.contains(&key) {
            debug!("Pod {} is in flight, parking update", key);
            state.parked.insert(key, QueuedPodInfo::new(pod));
            return;
        }
        if let Some(info) = state.active.iter_mut().find(|i| i.key() == key) {
            info.pod = pod;
            return;
        }
        if let Some(info) = state.backing_off.get_mut(&key) {
            info.pod = pod;
            return;
        }

        debug!("Adding pod {} to the scheduling queue", key);
        state.active.push(QueuedPodInfo::new(pod));
        drop(state);
        self.notify.notify_one();
    }

    fn take_next(&self, state: &mut QueueState) -> Option<QueuedPodInfo> {
        if state.active.is_empty() {
            return None;
        }
        let index = match &self.sort {
            Some(sort) => {
                let mut best = 0;
                for i in 1..state.active.len() {
                    if sort.less(&state.active[i], &state.active[best]) {
                        best = i;
                    }
                }
                best
            }
            None => 0,
        };

        let mut info = state.active.remove(index);
        info.attempts += 1;
        state.in_flight.insert(info.key());
        Some(info)
    }

    /// Wait for the next pod. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<QueuedPodInfo> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(info) = self.take_next(&mut state) {
                    return Some(info);
                }
            }

            notified.await;
        }
    }

    /// Mark a popped pod's cycle as finished, releasing any parked update.
    ///
    /// A pod already backing off keeps its timer; the parked version only
    /// replaces the copy that will be released.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        let info = match state.parked.remove(key) {
            Some(info) => info,
            None => return,
        };
        if let Some(backing_off) = state.backing_off.get_mut(key) {
            debug!("Pod {} is backing off, folding parked update", key);
            backing_off.pod = info.pod;
            return;
        }
        state.active.push(info);
        drop(state);
        self.notify.notify_one();
    }

    /// Drop a pod from the queue wherever it waits
    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock();
        state.active.retain(|i| i.key() != key);
        state.backing_off.remove(key);
        state.parked.remove(key);
    }

    /// Backoff for the given attempt count: `initial * 2^(attempts-1)`, capped
    pub fn backoff_duration(&self, attempts: u32) -> Duration {
        let mut duration = self.initial_backoff;
        for _ in 1..attempts {
            duration = duration.saturating_mul(2);
            if duration >= self.max_backoff {
                return self.max_backoff;
            }
        }
        duration.min(self.max_backoff)
    }

    /// Return a failed pod to the queue after its backoff expires
    pub fn requeue_with_backoff(self: &Arc<Self>, info: QueuedPodInfo) {
        let key = info.key();
        let backoff = self.backoff_duration(info.attempts);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.parked.contains_key(&key) {
                debug!("Pod {} has a newer version queued, skipping backoff", key);
                return;
            }
            debug!(
                "Backing off pod {} for {:?} after {} attempts",
                key, backoff, info.attempts
            );
            state.backing_off.insert(key.clone(), info);
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(queue) = queue.upgrade() {
                queue.finish_backoff(&key);
            }
        });
    }

    fn finish_backoff(&self, key: &str) {
        let mut state = self.state.lock();
        let mut info = match state.backing_off.remove(key) {
            Some(info) => info,
            None => return,
        };
        info.timestamp = Instant::now();

        if state.in_flight.contains(key) {
            // Released by `done` unless a newer version is already parked
            state.parked.entry(key.to_string()).or_insert(info);
            return;
        }
        if let Some(queued) = state.active.iter_mut().find(|i| i.key() == key) {
            queued.attempts = queued.attempts.max(info.attempts);
            return;
        }
        state.active.push(info);
        drop(state);
        self.notify.notify_one();
    }

    /// Wake every waiting `pop` and make further pops return `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Pods ready to be popped
    pub fn len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backing_off_len(&self) -> usize {
        self.state.lock().backing_off.len()
    }

    /// Whether the pod is waiting anywhere in the queue
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.active.iter().any(|i| i.key() == key)
            || state.backing_off.contains_key(key)
            || state.parked.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PrioritySort;
    use crate::test_util::create_test_pod;

    fn fifo() -> Arc<SchedulingQueue> {
        Arc::new(SchedulingQueue::new(
            None,
            DEFAULT_POD_INITIAL_BACKOFF,
            DEFAULT_POD_MAX_BACKOFF,
        ))
    }

    fn with_priority(name: &str, priority: i32) -> Pod {
        let mut pod = create_test_pod(name, "default");
        pod.spec.as_mut().unwrap().priority = Some(priority);
        pod
    }

    #[tokio::test]
    async fn test_fifo_order_and_dedupe() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        queue.add(create_test_pod("b", "default"));
        queue.add(create_test_pod("a", "default"));
        assert_eq!(queue.len(), 2);

        let first = queue.pop().await.unwrap();
        assert_eq!(first.key(), "default/a");
        assert_eq!(first.attempts, 1);
        assert_eq!(queue.pop().await.unwrap().key(), "default/b");
    }

    #[tokio::test]
    async fn test_priority_sort_order() {
        let queue = SchedulingQueue::new(
            Some(Arc::new(PrioritySort)),
            DEFAULT_POD_INITIAL_BACKOFF,
            DEFAULT_POD_MAX_BACKOFF,
        );
        queue.add(with_priority("low", 1));
        queue.add(with_priority("high", 10));
        queue.add(with_priority("mid", 5));

        let order: Vec<String> = vec![
            queue.pop().await.unwrap().key(),
            queue.pop().await.unwrap().key(),
            queue.pop().await.unwrap().key(),
        ];
        assert_eq!(order, vec!["default/high", "default/mid", "default/low"]);
    }

    #[tokio::test]
    async fn test_update_while_in_flight_is_parked() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        let _info = queue.pop().await.unwrap();

        queue.add(create_test_pod("a", "default"));
        assert!(queue.is_empty());
        assert!(queue.contains("default/a"));

        queue.done("default/a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_before_pop() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        queue.delete("default/a");

        assert!(queue.is_empty());
        assert!(!queue.contains("default/a"));
    }

    #[tokio::test]
    async fn test_pop_waits_for_add() {
        let queue = fifo();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.add(create_test_pod("late", "default"));
        let info = popper.await.unwrap().unwrap();
        assert_eq!(info.key(), "default/late");
    }

    #[tokio::test]
    async fn test_close_wakes_poppers() {
        let queue = fifo();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert!(popper.await.unwrap().is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = fifo();
        assert_eq!(queue.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(queue.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(queue.backoff_duration(4), Duration::from_secs(8));
        assert_eq!(queue.backoff_duration(5), Duration::from_secs(10));
        assert_eq!(queue.backoff_duration(50), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_with_backoff() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        let mut info = queue.pop().await.unwrap();
        info.attempts = 2;
        queue.requeue_with_backoff(info);
        queue.done("default/a");

        assert!(queue.is_empty());
        assert_eq!(queue.backing_off_len(), 1);

        let started = Instant::now();
        let info = queue.pop().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(info.attempts, 3);
        assert_eq!(queue.backing_off_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_during_failed_cycle_is_queued_once() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        let info = queue.pop().await.unwrap();
        queue.requeue_with_backoff(info);

        let mut updated = create_test_pod("a", "default");
        updated
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "web".to_string());
        queue.add(updated);
        queue.done("default/a");
        assert!(queue.is_empty());
        assert_eq!(queue.backing_off_len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.backing_off_len(), 0);

        let info = queue.pop().await.unwrap();
        assert_eq!(info.attempts, 2);
        assert!(info.pod.metadata.labels.is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_expiring_mid_cycle_waits_for_done() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        let info = queue.pop().await.unwrap();
        queue.requeue_with_backoff(info);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.is_empty());

        queue.done("default/a");
        assert_eq!(queue.len(), 1);
        let _info = queue.pop().await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_pod_does_not_return_from_backoff() {
        let queue = fifo();
        queue.add(create_test_pod("a", "default"));
        let info = queue.pop().await.unwrap();
        queue.requeue_with_backoff(info);
        queue.done("default/a");
        queue.delete("default/a");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());
    }
}
