use crate::cache::Snapshot;
use crate::error::{Result, SchedulerError};
use crate::framework::{Code, CycleState, Status};
use crate::profile::Profile;
use crate::types::{FitError, ScheduleResult};
use async_trait::async_trait;
use berth_core::{pod_key, Pod};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Chooses a node for a pod from a cache snapshot
#[async_trait]
pub trait ScheduleAlgorithm: Send + Sync {
    async fn schedule(
        &self,
        profile: &Profile,
        state: &mut CycleState,
        pod: &Pod,
        snapshot: &Snapshot,
    ) -> Result<ScheduleResult>;
}

/// PreFilter, Filter and extender filtering, then the nominated node if it
/// is feasible or else the first feasible node.
///
/// Evaluation starts one past the previously chosen node so consecutive
/// pods spread across the cluster.
#[derive(Default)]
pub struct GenericScheduler {
    next_start_node_index: AtomicUsize,
}

impl GenericScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn fit_error(pod: &Pod, snapshot: &Snapshot, statuses: HashMap<String, Status>) -> SchedulerError {
        SchedulerError::Fit(FitError {
            pod: pod.clone(),
            num_all_nodes: snapshot.num_nodes(),
            filtered_nodes_statuses: statuses,
        })
    }
}

#[async_trait]
impl ScheduleAlgorithm for GenericScheduler {
    async fn schedule(
        &self,
        profile: &Profile,
        state: &mut CycleState,
        pod: &Pod,
        snapshot: &Snapshot,
    ) -> Result<ScheduleResult> {
        if snapshot.is_empty() {
            return Err(SchedulerError::NoNodesAvailable);
        }
        let framework = profile.framework();
        let num_nodes = snapshot.num_nodes();

        let status = framework.run_pre_filter_plugins(state, pod);
        if !status.is_success() {
            if !status.is_unschedulable() {
                return Err(SchedulerError::from_status(&status));
            }
            let statuses = snapshot
                .nodes()
                .iter()
                .filter_map(|n| n.node_name())
                .map(|name| (name.to_string(), status.clone()))
                .collect();
            return Err(Self::fit_error(pod, snapshot, statuses));
        }

        let start = self.next_start_node_index.load(Ordering::Relaxed) % num_nodes;
        let mut feasible: Vec<(usize, String)> = Vec::new();
        let mut statuses: HashMap<String, Status> = HashMap::new();
        for offset in 0..num_nodes {
            let index = (start + offset) % num_nodes;
            let node_info = &snapshot.nodes()[index];
            let name = match node_info.node_name() {
                Some(name) => name.to_string(),
                None => continue,
            };

            let status = framework.run_filter_plugins(state, pod, node_info);
            match status.code() {
                Code::Success => feasible.push((index, name)),
                Code::Unschedulable | Code::UnschedulableAndUnresolvable => {
                    statuses.insert(name, status);
                }
                _ => return Err(SchedulerError::from_status(&status)),
            }
        }

        for extender in profile.extenders() {
            if feasible.is_empty() {
                break;
            }
            if !extender.is_interested(pod) {
                continue;
            }

            let names: Vec<String> = feasible.iter().map(|(_, name)| name.clone()).collect();
            let result = match extender.filter(pod, &names).await {
                Ok(result) => result,
                Err(e) if extender.is_ignorable() => {
                    warn!("Skipping ignorable extender {}: {}", extender.name(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let accepted: HashSet<&String> = result.node_names.iter().collect();
            for (name, reason) in result.failed_nodes {
                statuses.insert(name, Status::unschedulable(reason));
            }
            feasible.retain(|(_, name)| {
                let keep = accepted.contains(name);
                if !keep {
                    statuses
                        .entry(name.clone())
                        .or_insert_with(|| Status::unschedulable(format!("node(s) were rejected by extender {}", extender.name())));
                }
                keep
            });
        }

        if feasible.is_empty() {
            debug!("No feasible nodes for pod {}", pod_key(pod));
            return Err(Self::fit_error(pod, snapshot, statuses));
        }

        let nominated = pod
            .status
            .as_ref()
            .and_then(|s| s.nominated_node_name.as_deref());
        let (index, host) = nominated
            .and_then(|n| feasible.iter().find(|(_, name)| name == n))
            .unwrap_or(&feasible[0])
            .clone();
        self.next_start_node_index
            .store((index + 1) % num_nodes, Ordering::Relaxed);

        Ok(ScheduleResult {
            suggested_host: host,
            evaluated_nodes: num_nodes,
            feasible_nodes: feasible.len(),
        })
    }
}
