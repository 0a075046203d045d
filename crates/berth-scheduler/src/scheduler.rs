use crate::algorithm::{GenericScheduler, ScheduleAlgorithm};
use crate::cache::SchedulerCache;
use crate::client::ClusterClient;
use crate::config::SchedulerConfiguration;
use crate::event_handlers::EventHandlers;
use crate::extender::{Extender, HttpExtender};
use crate::framework::{Code, CycleState, FrameworkHandle, Registry, WaitingPods};
use crate::plugins::in_tree_registry;
use crate::policy::Policy;
use crate::profile::{Profile, ProfileMap};
use crate::queue::SchedulingQueue;
use crate::recorder::{EventSink, EventType, REASON_FAILED_SCHEDULING, REASON_SCHEDULED};
use crate::status::{unscheduled_condition, update_pod, REASON_SCHEDULER_ERROR, REASON_UNSCHEDULABLE};
use crate::types::{new_binding, QueuedPodInfo};
use crate::{Result, SchedulerError};
use async_trait::async_trait;
use berth_core::{is_assigned, is_terminating, pod_key, Pod};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Called once for every failed cycle
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle_failure(&self, profile: &Profile, info: QueuedPodInfo, err: &SchedulerError);
}

/// Records a FailedScheduling event, marks the pod `PodScheduled=False` and
/// puts its latest version back in the queue after backoff
pub struct RequeueOnFailure {
    client: Arc<dyn ClusterClient>,
    queue: Arc<SchedulingQueue>,
}

impl RequeueOnFailure {
    pub fn new(client: Arc<dyn ClusterClient>, queue: Arc<SchedulingQueue>) -> Self {
        Self { client, queue }
    }
}

#[async_trait]
impl FailureHandler for RequeueOnFailure {
    async fn handle_failure(&self, profile: &Profile, mut info: QueuedPodInfo, err: &SchedulerError) {
        let key = info.key();
        let message = err.to_string();
        if err.is_unschedulable() {
            info!("Unable to schedule pod {}: {}", key, message);
        } else {
            error!("Error scheduling pod {}: {}", key, message);
        }

        profile
            .recorder()
            .event(&info.pod, EventType::Warning, REASON_FAILED_SCHEDULING, message.clone());

        let reason = if err.is_unschedulable() {
            REASON_UNSCHEDULABLE
        } else {
            REASON_SCHEDULER_ERROR
        };
        let condition = unscheduled_condition(reason, message);
        if let Err(e) = update_pod(self.client.as_ref(), &info.pod, &condition, None).await {
            error!("Failed to update status of pod {}: {}", key, e);
        }

        let namespace = info.pod.metadata.namespace.clone().unwrap_or_default();
        let name = info.pod.metadata.name.clone().unwrap_or_default();
        match self.client.get_pod(&namespace, &name).await {
            Ok(Some(current)) if is_assigned(&current) => {
                debug!("Pod {} was assigned in the meantime, not requeuing", key);
            }
            Ok(Some(current)) => {
                info.pod = current;
                self.queue.requeue_with_backoff(info);
            }
            Ok(None) => debug!("Pod {} no longer exists, not requeuing", key),
            Err(e) => {
                warn!("Failed to fetch pod {}, requeuing cached copy: {}", key, e);
                self.queue.requeue_with_backoff(info);
            }
        }
    }
}

/// Assembles a [`Scheduler`] from configuration
pub struct SchedulerBuilder {
    config: SchedulerConfiguration,
    client: Arc<dyn ClusterClient>,
    event_sink: Arc<dyn EventSink>,
    out_of_tree: Registry,
    extenders: Option<Vec<Arc<dyn Extender>>>,
    algorithm: Option<Arc<dyn ScheduleAlgorithm>>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl SchedulerBuilder {
    pub fn new(client: Arc<dyn ClusterClient>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            config: SchedulerConfiguration::default(),
            client,
            event_sink,
            out_of_tree: Registry::new(),
            extenders: None,
            algorithm: None,
            failure_handler: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Plugins merged into the built-in registry; a name collision fails `build`
    pub fn out_of_tree_registry(mut self, registry: Registry) -> Self {
        self.out_of_tree = registry;
        self
    }

    /// Use these extenders instead of the HTTP extenders from the configuration
    pub fn extenders(mut self, extenders: Vec<Arc<dyn Extender>>) -> Self {
        self.extenders = Some(extenders);
        self
    }

    pub fn algorithm(mut self, algorithm: Arc<dyn ScheduleAlgorithm>) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let mut config = self.config;
        if let Some(path) = config.policy_file.clone() {
            let policy = Policy::load(&path)?;
            config.apply_policy(&policy)?;
            info!("Applied scheduling policy from {}", path.display());
        }
        config.validate()?;

        let mut registry = in_tree_registry();
        registry.merge(&self.out_of_tree)?;

        let extenders = match self.extenders {
            Some(extenders) => extenders,
            None => config
                .extenders
                .iter()
                .map(|e| HttpExtender::new(e).map(|e| Arc::new(e) as Arc<dyn Extender>))
                .collect::<Result<Vec<_>>>()?,
        };

        let waiting_pods = Arc::new(WaitingPods::new());
        let handle = FrameworkHandle::new(self.client.clone(), waiting_pods.clone());
        let profiles = Arc::new(ProfileMap::new(
            &config.profiles_or_default(),
            &registry,
            &handle,
            self.event_sink,
            extenders,
        )?);

        let queue = Arc::new(SchedulingQueue::new(
            profiles.queue_sort(),
            config.pod_initial_backoff(),
            config.pod_max_backoff(),
        ));
        let failure_handler = match self.failure_handler {
            Some(handler) => handler,
            None => Arc::new(RequeueOnFailure::new(self.client.clone(), queue.clone()))
                as Arc<dyn FailureHandler>,
        };
        let algorithm = match self.algorithm {
            Some(algorithm) => algorithm,
            None => Arc::new(GenericScheduler::new()) as Arc<dyn ScheduleAlgorithm>,
        };

        Ok(Scheduler {
            cache: Arc::new(SchedulerCache::new(config.assumed_pod_ttl())),
            queue,
            profiles,
            algorithm,
            failure_handler,
            waiting_pods,
            bindings: TaskTracker::new(),
        })
    }
}

/// The scheduling control loop: one pod per cycle, bindings detached
pub struct Scheduler {
    cache: Arc<SchedulerCache>,
    queue: Arc<SchedulingQueue>,
    profiles: Arc<ProfileMap>,
    algorithm: Arc<dyn ScheduleAlgorithm>,
    failure_handler: Arc<dyn FailureHandler>,
    waiting_pods: Arc<WaitingPods>,
    bindings: TaskTracker,
}

impl Scheduler {
    pub fn cache(&self) -> &Arc<SchedulerCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    pub fn profiles(&self) -> &Arc<ProfileMap> {
        &self.profiles
    }

    pub fn waiting_pods(&self) -> &Arc<WaitingPods> {
        &self.waiting_pods
    }

    /// Watch handlers feeding this scheduler's queue and cache
    pub fn event_handlers(&self) -> EventHandlers {
        EventHandlers::new(
            self.cache.clone(),
            self.queue.clone(),
            self.profiles.clone(),
            self.waiting_pods.clone(),
        )
    }

    /// Schedule pods until cancelled, then wait for in-flight bindings
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting scheduler with profiles {:?}", self.profiles.names());

        while self.schedule_one(&token).await {}

        self.queue.close();
        info!(
            "Scheduler shutting down, waiting for {} in-flight bindings",
            self.bindings.len()
        );
        self.wait_for_inflight_bindings().await;
        info!("Scheduler stopped");
    }

    /// Wait until every detached binding task has finished
    pub async fn wait_for_inflight_bindings(&self) {
        self.bindings.close();
        self.bindings.wait().await;
        self.bindings.reopen();
    }

    /// Run one scheduling cycle. Returns false once cancelled or the queue is closed.
    pub async fn schedule_one(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let info = tokio::select! {
            _ = token.cancelled() => return false,
            info = self.queue.pop() => match info {
                Some(info) => info,
                None => return false,
            },
        };
        let key = info.key();

        let profile = match self.profiles.for_pod(&info.pod) {
            Some(profile) => profile.clone(),
            None => {
                debug!("No profile for pod {}, skipping", key);
                self.queue.done(&key);
                return true;
            }
        };
        if self.skip_pod_schedule(&info.pod) {
            self.queue.done(&key);
            return true;
        }

        debug!("Attempting to schedule pod {} (attempt {})", key, info.attempts);
        let mut state = CycleState::new();
        let snapshot = self.cache.snapshot();
        let result = match self
            .algorithm
            .schedule(&profile, &mut state, &info.pod, &snapshot)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.fail(&profile, info, e).await;
                return true;
            }
        };
        if token.is_cancelled() {
            self.queue.done(&key);
            return false;
        }

        let host = result.suggested_host;
        debug!(
            "Selected node {} for pod {} ({}/{} nodes feasible)",
            host, key, result.feasible_nodes, result.evaluated_nodes
        );

        // Assume first so every later snapshot sees the reservation
        let mut assumed = info.pod.clone();
        assumed.spec.get_or_insert_with(Default::default).node_name = Some(host.clone());
        if let Err(e) = self.cache.assume_pod(&assumed) {
            self.fail(&profile, info, e).await;
            return true;
        }

        let framework = profile.framework();
        let status = framework
            .run_reserve_plugins_reserve(&mut state, &assumed, &host)
            .await;
        if !status.is_success() {
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.fail(&profile, info, SchedulerError::from_status(&status)).await;
            return true;
        }

        let status = framework.run_permit_plugins(&state, &assumed, &host).await;
        if !status.is_success() && status.code() != Code::Wait {
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.fail(&profile, info, SchedulerError::from_status(&status)).await;
            return true;
        }

        if token.is_cancelled() {
            self.waiting_pods.cancel(&key, "scheduler is shutting down");
            framework.wait_on_permit(&assumed).await;
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.queue.done(&key);
            return false;
        }

        let this = Arc::clone(self);
        let token = token.clone();
        self.bindings.spawn(async move {
            this.binding_cycle(profile, state, info, assumed, host, token)
                .await;
        });
        true
    }

    /// Pods being deleted, or already assumed or bound, need no cycle
    fn skip_pod_schedule(&self, pod: &Pod) -> bool {
        let key = pod_key(pod);
        if is_terminating(pod) {
            debug!("Skipping pod {} which is being deleted", key);
            return true;
        }
        if is_assigned(pod) || self.cache.is_assumed_pod(pod) {
            debug!("Skipping pod {} which is already assumed or bound", key);
            return true;
        }
        false
    }

    async fn binding_cycle(
        self: Arc<Self>,
        profile: Arc<Profile>,
        mut state: CycleState,
        info: QueuedPodInfo,
        assumed: Pod,
        host: String,
        token: CancellationToken,
    ) {
        let key = info.key();
        let framework = profile.framework();

        let permit = framework.wait_on_permit(&assumed);
        tokio::pin!(permit);
        let verdict = tokio::select! {
            status = &mut permit => Some(status),
            _ = token.cancelled() => None,
        };
        let status = match verdict {
            Some(status) => status,
            None => {
                self.waiting_pods.cancel(&key, "scheduler is shutting down");
                permit.await;
                self.abort(&profile, &mut state, &assumed, &host).await;
                return;
            }
        };
        if !status.is_success() {
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.fail(&profile, info, SchedulerError::from_status(&status)).await;
            return;
        }
        if token.is_cancelled() {
            self.abort(&profile, &mut state, &assumed, &host).await;
            return;
        }

        let status = framework.run_pre_bind_plugins(&state, &assumed, &host).await;
        if !status.is_success() {
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.fail(&profile, info, SchedulerError::from_status(&status)).await;
            return;
        }
        if token.is_cancelled() {
            self.abort(&profile, &mut state, &assumed, &host).await;
            return;
        }

        if let Err(e) = self.bind(&profile, &state, &assumed, &host).await {
            self.rollback(&profile, &mut state, &assumed, &host).await;
            self.fail(&profile, info, e).await;
            return;
        }

        if let Err(e) = self.cache.finish_binding(&assumed) {
            warn!("Scheduler cache finish_binding failed for {}: {}", key, e);
        }
        info!("Bound pod {} to node {}", key, host);
        profile.recorder().event(
            &assumed,
            EventType::Normal,
            REASON_SCHEDULED,
            format!("Successfully assigned {} to {}", key, host),
        );
        framework.run_post_bind_plugins(&state, &assumed, &host).await;
        self.queue.done(&key);
    }

    /// The first interested binder extender binds; otherwise the Bind plugins
    async fn bind(&self, profile: &Profile, state: &CycleState, pod: &Pod, host: &str) -> Result<()> {
        if let Some(extender) = profile.binder_extender(pod) {
            debug!("Binding pod {} through extender {}", pod_key(pod), extender.name());
            return extender.bind(&new_binding(pod, host)).await;
        }

        let status = profile.framework().run_bind_plugins(state, pod, host).await;
        match status.code() {
            Code::Success => Ok(()),
            Code::Skip => Err(SchedulerError::internal_error(format!(
                "no bind plugin bound pod {}",
                pod_key(pod)
            ))),
            _ => Err(SchedulerError::from_status(&status)),
        }
    }

    /// Undo Reserve and the assumption
    async fn rollback(&self, profile: &Profile, state: &mut CycleState, assumed: &Pod, host: &str) {
        profile
            .framework()
            .run_reserve_plugins_unreserve(state, assumed, host)
            .await;
        if let Err(e) = self.cache.forget_pod(assumed) {
            error!("Scheduler cache forget_pod failed for {}: {}", pod_key(assumed), e);
        }
    }

    /// Roll back a cycle interrupted by shutdown, without reporting it
    async fn abort(&self, profile: &Profile, state: &mut CycleState, assumed: &Pod, host: &str) {
        let key = pod_key(assumed);
        debug!("Aborting cycle of pod {} on shutdown", key);
        self.rollback(profile, state, assumed, host).await;
        self.queue.done(&key);
    }

    async fn fail(&self, profile: &Profile, info: QueuedPodInfo, err: SchedulerError) {
        let key = info.key();
        self.failure_handler.handle_failure(profile, info, &err).await;
        self.queue.done(&key);
    }
}
