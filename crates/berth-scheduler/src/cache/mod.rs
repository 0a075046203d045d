pub mod node_info;
pub mod snapshot;

pub use node_info::NodeInfo;
pub use snapshot::Snapshot;

use crate::error::{Result, SchedulerError};
use berth_core::{node_name, pod_key, Node, Pod};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lifetime of an assumed pod after its binding finished
pub const DEFAULT_ASSUMED_POD_TTL: Duration = Duration::from_secs(30);

struct PodState {
    pod: Pod,
    node: String,
    /// Set once the binding call returned; the assumption expires after it
    deadline: Option<Instant>,
}

/// Running totals of assumption lifecycle transitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub assumed: u64,
    pub forgotten: u64,
    pub expired: u64,
}

#[derive(Default)]
struct CacheState {
    slots: Vec<Option<NodeInfo>>,
    slot_index: HashMap<String, usize>,
    free_slots: Vec<usize>,
    pod_states: HashMap<String, PodState>,
    assumed: HashSet<String>,
    stats: CacheStats,
}

impl CacheState {
    fn slot_mut(&mut self, node: &str) -> Option<&mut NodeInfo> {
        let i = *self.slot_index.get(node)?;
        self.slots[i].as_mut()
    }

    fn ensure_slot(&mut self, node: &str) -> &mut NodeInfo {
        let i = match self.slot_index.get(node) {
            Some(i) => *i,
            None => {
                let i = match self.free_slots.pop() {
                    Some(i) => i,
                    None => {
                        self.slots.push(None);
                        self.slots.len() - 1
                    }
                };
                self.slot_index.insert(node.to_string(), i);
                i
            }
        };
        self.slots[i].get_or_insert_with(NodeInfo::default)
    }

    fn release_slot_if_unused(&mut self, node: &str) {
        let unused = self
            .slot_mut(node)
            .map(|info| info.node().is_none() && info.pods().is_empty())
            .unwrap_or(false);
        if unused {
            if let Some(i) = self.slot_index.remove(node) {
                self.slots[i] = None;
                self.free_slots.push(i);
            }
        }
    }

    fn add_pod_to_node(&mut self, node: &str, pod: Pod) {
        self.ensure_slot(node).add_pod(pod);
    }

    fn remove_pod_from_node(&mut self, node: &str, key: &str) {
        if let Some(info) = self.slot_mut(node) {
            info.remove_pod(key);
        }
        self.release_slot_if_unused(node);
    }
}

fn assigned_node(pod: &Pod) -> Result<String> {
    node_name(pod).map(str::to_string).ok_or_else(|| {
        SchedulerError::cache_error(format!("pod {} has no node assigned", pod_key(pod)))
    })
}

/// Node and pod state as the scheduler believes it to be, including pods
/// assumed onto nodes whose binding is not confirmed yet.
///
/// Every mutation takes the write lock for an in-memory update only;
/// snapshots take the read lock.
pub struct SchedulerCache {
    state: RwLock<CacheState>,
    ttl: Duration,
}

impl Default for SchedulerCache {
    fn default() -> Self {
        Self::new(DEFAULT_ASSUMED_POD_TTL)
    }
}

impl SchedulerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ttl,
        }
    }

    /// Tentatively place a pod (whose `spec.nodeName` is set) on its node.
    /// Visible to every snapshot taken afterwards.
    pub fn assume_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let node = assigned_node(pod)?;
        let mut state = self.state.write();
        if state.pod_states.contains_key(&key) {
            return Err(SchedulerError::cache_error(format!(
                "pod {} is in the cache, so can't be assumed",
                key
            )));
        }

        state.add_pod_to_node(&node, pod.clone());
        state.pod_states.insert(
            key.clone(),
            PodState {
                pod: pod.clone(),
                node,
                deadline: None,
            },
        );
        state.assumed.insert(key);
        state.stats.assumed += 1;
        Ok(())
    }

    /// Start the expiry clock of an assumed pod once its binding returned
    pub fn finish_binding(&self, pod: &Pod) -> Result<()> {
        self.finish_binding_at(pod, Instant::now())
    }

    fn finish_binding_at(&self, pod: &Pod, now: Instant) -> Result<()> {
        let key = pod_key(pod);
        let mut state = self.state.write();
        if !state.assumed.contains(&key) {
            debug!("Pod {} finished binding but is no longer assumed", key);
            return Ok(());
        }
        if let Some(ps) = state.pod_states.get_mut(&key) {
            ps.deadline = Some(now + self.ttl);
        }
        Ok(())
    }

    /// Drop an assumption, releasing its reservation
    pub fn forget_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let mut state = self.state.write();

        let node = match state.pod_states.get(&key) {
            Some(ps) if state.assumed.contains(&key) => ps.node.clone(),
            Some(_) => {
                return Err(SchedulerError::cache_error(format!(
                    "pod {} was added, only assumed pods can be forgotten",
                    key
                )))
            }
            None => {
                return Err(SchedulerError::cache_error(format!(
                    "pod {} is not in the cache, so can't be forgotten",
                    key
                )))
            }
        };
        if let Some(requested) = node_name(pod) {
            if requested != node {
                return Err(SchedulerError::cache_error(format!(
                    "pod {} was assumed on {} but asked to forget from {}",
                    key, node, requested
                )));
            }
        }

        state.remove_pod_from_node(&node, &key);
        state.pod_states.remove(&key);
        state.assumed.remove(&key);
        state.stats.forgotten += 1;
        debug!("Forgot assumed pod {} on node {}", key, node);
        Ok(())
    }

    /// Record a pod confirmed by the workload store. Confirms an assumption,
    /// moving the pod if it landed on a different node than assumed.
    pub fn add_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let node = assigned_node(pod)?;
        let mut state = self.state.write();

        let previous = match state.pod_states.get(&key) {
            Some(ps) if state.assumed.contains(&key) => Some(ps.node.clone()),
            Some(_) => {
                return Err(SchedulerError::cache_error(format!(
                    "pod {} was already in added state",
                    key
                )))
            }
            None => None,
        };

        if let Some(previous) = previous {
            if previous != node {
                info!("Pod {} was assumed on {} but bound to {}", key, previous, node);
            }
            state.remove_pod_from_node(&previous, &key);
            state.assumed.remove(&key);
        }

        state.add_pod_to_node(&node, pod.clone());
        state.pod_states.insert(
            key,
            PodState {
                pod: pod.clone(),
                node,
                deadline: None,
            },
        );
        Ok(())
    }

    /// Replace a confirmed pod with its newer version
    pub fn update_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let node = assigned_node(pod)?;
        let mut state = self.state.write();

        let previous = match state.pod_states.get(&key) {
            Some(_) if state.assumed.contains(&key) => {
                return Err(SchedulerError::cache_error(format!(
                    "assumed pod {} can't be updated",
                    key
                )))
            }
            Some(ps) => ps.node.clone(),
            None => {
                return Err(SchedulerError::cache_error(format!(
                    "pod {} is not in the cache, so can't be updated",
                    key
                )))
            }
        };

        state.remove_pod_from_node(&previous, &key);
        state.add_pod_to_node(&node, pod.clone());
        state.pod_states.insert(
            key,
            PodState {
                pod: pod.clone(),
                node,
                deadline: None,
            },
        );
        Ok(())
    }

    /// Remove a pod whether it was assumed or added. Removing an unknown pod
    /// is a no-op.
    pub fn remove_pod(&self, pod: &Pod) -> Result<()> {
        self.remove_pod_by_key(&pod_key(pod));
        Ok(())
    }

    fn remove_pod_by_key(&self, key: &str) {
        let mut state = self.state.write();
        match state.pod_states.remove(key) {
            Some(ps) => {
                state.remove_pod_from_node(&ps.node, key);
                state.assumed.remove(key);
            }
            None => debug!("Pod {} is not in the cache, nothing to remove", key),
        }
    }

    pub fn is_assumed_pod(&self, pod: &Pod) -> bool {
        self.state.read().assumed.contains(&pod_key(pod))
    }

    /// Cached copy of a pod, assumed or added
    pub fn get_pod(&self, key: &str) -> Option<Pod> {
        self.state.read().pod_states.get(key).map(|ps| ps.pod.clone())
    }

    /// Number of pods known to the cache, assumed ones included
    pub fn pod_count(&self) -> usize {
        self.state.read().pod_states.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.state.read().stats
    }

    /// Keys of all assumed pods
    pub fn assumed_pods(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().assumed.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn add_node(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.clone().ok_or_else(|| {
            SchedulerError::CoreError(berth_core::BerthError::missing_field("Node", "metadata.name"))
        })?;
        let mut state = self.state.write();
        state.ensure_slot(&name).set_node(node.clone());
        Ok(())
    }

    pub fn update_node(&self, node: &Node) -> Result<()> {
        self.add_node(node)
    }

    /// Forget a node. Pods still placed on it keep the slot alive, without a
    /// node, until they are removed.
    pub fn remove_node(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.slot_mut(name) {
            Some(info) if info.node().is_some() => info.clear_node(),
            _ => {
                return Err(SchedulerError::cache_error(format!(
                    "node {} is not in the cache",
                    name
                )))
            }
        }
        state.release_slot_if_unused(name);
        Ok(())
    }

    /// Number of nodes with a node object
    pub fn node_count(&self) -> usize {
        self.state
            .read()
            .slots
            .iter()
            .flatten()
            .filter(|info| info.node().is_some())
            .count()
    }

    /// Point-in-time copy of every node that has a node object
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let nodes = state
            .slots
            .iter()
            .flatten()
            .filter(|info| info.node().is_some())
            .cloned()
            .collect();
        Snapshot::new(nodes)
    }

    /// Drop assumed pods whose binding finished more than the TTL ago.
    /// Returns how many expired.
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let mut state = self.state.write();
        let expired: Vec<(String, String)> = state
            .assumed
            .iter()
            .filter_map(|key| {
                let ps = state.pod_states.get(key)?;
                match ps.deadline {
                    Some(deadline) if deadline <= now => Some((key.clone(), ps.node.clone())),
                    _ => None,
                }
            })
            .collect();

        for (key, node) in &expired {
            warn!("Assumed pod {} on node {} expired", key, node);
            state.remove_pod_from_node(node, key);
            state.pod_states.remove(key);
            state.assumed.remove(key);
        }
        state.stats.expired += expired.len() as u64;
        expired.len()
    }

    /// Periodically expire stale assumptions until cancelled
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!("Starting assumed pod cleanup (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Assumed pod cleanup shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let expired = self.cleanup_expired(Instant::now());
                    if expired > 0 {
                        debug!("Expired {} assumed pods", expired);
                    }
                }
            }
        }
    }
}
