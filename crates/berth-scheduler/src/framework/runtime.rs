use super::interface::*;
use super::waiting_pods::{WaitingPod, MAX_PERMIT_TIMEOUT};
use super::{FrameworkHandle, Registry};
use crate::cache::NodeInfo;
use crate::config::{Plugins, ProfileConfig};
use crate::error::{Result, SchedulerError};
use berth_core::{pod_key, Pod};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// The instantiated plugin pipeline of one profile
pub struct Framework {
    profile_name: String,
    handle: FrameworkHandle,
    queue_sort: Option<Arc<dyn QueueSortPlugin>>,
    pre_filter: Vec<Arc<dyn PreFilterPlugin>>,
    filter: Vec<Arc<dyn FilterPlugin>>,
    reserve: Vec<Arc<dyn ReservePlugin>>,
    permit: Vec<Arc<dyn PermitPlugin>>,
    pre_bind: Vec<Arc<dyn PreBindPlugin>>,
    bind: Vec<Arc<dyn BindPlugin>>,
    post_bind: Vec<Arc<dyn PostBindPlugin>>,
    enabled: BTreeMap<ExtensionPoint, Vec<String>>,
}

/// Cast a plugin to the phase trait of an extension point
fn require<T: ?Sized>(
    plugin: &Arc<dyn Plugin>,
    point: ExtensionPoint,
    cast: impl FnOnce(Arc<dyn Plugin>) -> Option<Arc<T>>,
) -> Result<Arc<T>> {
    cast(plugin.clone()).ok_or_else(|| {
        SchedulerError::invalid_configuration(
            format!("plugin {:?} does not extend {} plugin", plugin.name(), point),
            format!("Remove {:?} from the {} plugin set", plugin.name(), point),
        )
    })
}

impl Framework {
    /// Instantiate every enabled plugin of a profile from the registry
    pub fn new(registry: &Registry, profile: &ProfileConfig, handle: FrameworkHandle) -> Result<Self> {
        let plugins: Plugins = profile.effective_plugins();

        let args: HashMap<&str, &serde_json::Value> = profile
            .plugin_config
            .iter()
            .map(|pc| (pc.name.as_str(), &pc.args))
            .collect();

        let mut instances: HashMap<String, Arc<dyn Plugin>> = HashMap::new();
        let mut enabled = BTreeMap::new();
        for point in ExtensionPoint::ALL {
            let names = plugins.get(point).enabled_names();
            for name in &names {
                if instances.contains_key(name) {
                    continue;
                }
                let factory = registry
                    .get(name)
                    .ok_or_else(|| SchedulerError::UnknownPlugin { name: name.clone() })?;
                let plugin = factory(args.get(name.as_str()).copied(), &handle)?;
                instances.insert(name.clone(), plugin);
            }
            enabled.insert(point, names);
        }

        let mut framework = Self {
            profile_name: profile.scheduler_name.clone(),
            handle,
            queue_sort: None,
            pre_filter: Vec::new(),
            filter: Vec::new(),
            reserve: Vec::new(),
            permit: Vec::new(),
            pre_bind: Vec::new(),
            bind: Vec::new(),
            post_bind: Vec::new(),
            enabled: BTreeMap::new(),
        };

        for (point, names) in &enabled {
            for name in names {
                let plugin = &instances[name];
                match point {
                    ExtensionPoint::QueueSort => {
                        if framework.queue_sort.is_some() {
                            return Err(SchedulerError::invalid_configuration(
                                "only one QueueSort plugin can be enabled",
                                "Disable all but one QueueSort plugin",
                            ));
                        }
                        framework.queue_sort = Some(require(plugin, *point, |p| p.as_queue_sort())?);
                    }
                    ExtensionPoint::PreFilter => framework
                        .pre_filter
                        .push(require(plugin, *point, |p| p.as_pre_filter())?),
                    ExtensionPoint::Filter => framework
                        .filter
                        .push(require(plugin, *point, |p| p.as_filter())?),
                    ExtensionPoint::Reserve => framework
                        .reserve
                        .push(require(plugin, *point, |p| p.as_reserve())?),
                    ExtensionPoint::Permit => framework
                        .permit
                        .push(require(plugin, *point, |p| p.as_permit())?),
                    ExtensionPoint::PreBind => framework
                        .pre_bind
                        .push(require(plugin, *point, |p| p.as_pre_bind())?),
                    ExtensionPoint::Bind => framework
                        .bind
                        .push(require(plugin, *point, |p| p.as_bind())?),
                    ExtensionPoint::PostBind => framework
                        .post_bind
                        .push(require(plugin, *point, |p| p.as_post_bind())?),
                }
            }
        }
        framework.enabled = enabled;

        debug!(
            "Built framework for profile {} with {} plugins",
            framework.profile_name,
            instances.len()
        );
        Ok(framework)
    }

    /// Scheduler name of the owning profile
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn handle(&self) -> &FrameworkHandle {
        &self.handle
    }

    pub fn queue_sort(&self) -> Option<Arc<dyn QueueSortPlugin>> {
        self.queue_sort.clone()
    }

    /// Name of the enabled QueueSort plugin, if any
    pub fn queue_sort_name(&self) -> Option<&str> {
        self.queue_sort.as_ref().map(|p| p.name())
    }

    /// Enabled plugin names per extension point
    pub fn list_plugins(&self) -> &BTreeMap<ExtensionPoint, Vec<String>> {
        &self.enabled
    }

    /// Run PreFilter plugins until one fails.
    ///
    /// Unschedulable statuses are returned as is so their reasons can be
    /// aggregated per node; errors carry the phase and plugin name.
    pub fn run_pre_filter_plugins(&self, state: &mut CycleState, pod: &Pod) -> Status {
        for plugin in &self.pre_filter {
            let status = plugin.pre_filter(state, pod);
            if !status.is_success() {
                if status.is_unschedulable() {
                    return status;
                }
                return status.with_plugin_context("PreFilter", plugin.name());
            }
        }
        Status::success()
    }

    /// Run Filter plugins against one node until one fails
    pub fn run_filter_plugins(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        for plugin in &self.filter {
            let status = plugin.filter(state, pod, node_info);
            if !status.is_success() {
                if status.is_unschedulable() {
                    return status;
                }
                return status.with_plugin_context("Filter", plugin.name());
            }
        }
        Status::success()
    }

    /// Run Reserve plugins in order; the first failure stops the phase
    pub async fn run_reserve_plugins_reserve(
        &self,
        state: &mut CycleState,
        pod: &Pod,
        node_name: &str,
    ) -> Status {
        for plugin in &self.reserve {
            let status = plugin.reserve(state, pod, node_name).await;
            if !status.is_success() {
                return status.with_plugin_context("Reserve", plugin.name());
            }
        }
        Status::success()
    }

    /// Undo Reserve in reverse order. Every plugin is called, including the
    /// one that failed, so implementations must tolerate a partial reserve.
    pub async fn run_reserve_plugins_unreserve(
        &self,
        state: &mut CycleState,
        pod: &Pod,
        node_name: &str,
    ) {
        for plugin in self.reserve.iter().rev() {
            plugin.unreserve(state, pod, node_name).await;
        }
    }

    /// Run Permit plugins. Any `Wait` verdicts register the pod as waiting
    /// and the overall status is `Wait`.
    pub async fn run_permit_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        let mut waits: HashMap<String, std::time::Duration> = HashMap::new();
        for plugin in &self.permit {
            let (status, timeout) = plugin.permit(state, pod, node_name).await;
            match status.code() {
                Code::Success => {}
                Code::Wait => {
                    let timeout = if timeout > MAX_PERMIT_TIMEOUT {
                        warn!(
                            "Permit plugin {} asked to wait {:?}, capping at {:?}",
                            plugin.name(),
                            timeout,
                            MAX_PERMIT_TIMEOUT
                        );
                        MAX_PERMIT_TIMEOUT
                    } else {
                        timeout
                    };
                    waits.insert(plugin.name().to_string(), timeout);
                }
                _ => return status.with_plugin_context("Permit", plugin.name()),
            }
        }

        if waits.is_empty() {
            return Status::success();
        }

        debug!("Pod {} waits on permit from {:?}", pod_key(pod), waits.keys());
        self.handle
            .waiting_pods()
            .add(WaitingPod::new(pod.clone(), waits));
        Status::wait()
    }

    /// Block until a waiting pod is allowed, rejected or times out.
    /// Returns success immediately for pods that are not waiting.
    pub async fn wait_on_permit(&self, pod: &Pod) -> Status {
        let key = pod_key(pod);
        let waiting = match self.handle.waiting_pods().get(&key) {
            Some(waiting) => waiting,
            None => return Status::success(),
        };
        let status = waiting.wait().await;
        self.handle.waiting_pods().remove(&key);
        status
    }

    pub async fn run_pre_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        for plugin in &self.pre_bind {
            let status = plugin.pre_bind(state, pod, node_name).await;
            if !status.is_success() {
                return status.with_plugin_context("PreBind", plugin.name());
            }
        }
        Status::success()
    }

    /// Offer the pod to each Bind plugin until one handles it.
    /// `Skip` means no plugin bound the pod.
    pub async fn run_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        for plugin in &self.bind {
            let status = plugin.bind(state, pod, node_name).await;
            match status.code() {
                Code::Skip => continue,
                Code::Success => return status,
                _ => return status.with_plugin_context("Bind", plugin.name()),
            }
        }
        Status::skip()
    }

    pub async fn run_post_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) {
        for plugin in &self.post_bind {
            plugin.post_bind(state, pod, node_name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginRef, PluginSet};
    use crate::plugins::in_tree_registry;
    use crate::test_util::{create_test_pod, fake_plugin_factory, test_handle, FakePlugin};
    use std::time::Duration;

    fn profile_with(point: ExtensionPoint, names: &[&str]) -> ProfileConfig {
        let mut plugins = Plugins::default();
        *plugins.get_mut(point) = PluginSet {
            enabled: names.iter().map(|n| PluginRef::new(*n)).collect(),
            disabled: vec![PluginRef::new("*")],
        };
        ProfileConfig {
            scheduler_name: "test".to_string(),
            plugins: Some(plugins),
            plugin_config: Vec::new(),
        }
    }

    fn registry_with(plugin: FakePlugin) -> Registry {
        let mut registry = in_tree_registry();
        let name = plugin.name().to_string();
        registry.register(name, fake_plugin_factory(plugin)).unwrap();
        registry
    }

    #[test]
    fn test_default_profile_lists_default_plugins() {
        let (handle, _) = test_handle();
        let framework =
            Framework::new(&in_tree_registry(), &ProfileConfig::default(), handle).unwrap();

        let plugins = framework.list_plugins();
        assert_eq!(plugins[&ExtensionPoint::QueueSort], vec!["PrioritySort"]);
        assert_eq!(plugins[&ExtensionPoint::Bind], vec!["DefaultBinder"]);
        assert!(plugins[&ExtensionPoint::Filter].contains(&"NodeResourcesFit".to_string()));
        assert_eq!(framework.queue_sort_name(), Some("PrioritySort"));
    }

    #[test]
    fn test_unknown_plugin_is_rejected() {
        let (handle, _) = test_handle();
        let profile = profile_with(ExtensionPoint::Filter, &["Missing"]);

        let err = Framework::new(&in_tree_registry(), &profile, handle)
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::UnknownPlugin { .. }));
    }

    #[test]
    fn test_plugin_must_implement_its_extension_point() {
        let (handle, _) = test_handle();
        let profile = profile_with(ExtensionPoint::Reserve, &["NodePorts"]);

        let err = Framework::new(&in_tree_registry(), &profile, handle)
            .err()
            .unwrap();
        assert!(err.to_string().contains("does not extend Reserve plugin"));
    }

    #[tokio::test]
    async fn test_reserve_failure_is_phase_qualified_and_unreserve_runs() {
        let fake = FakePlugin::new("FakeReserve").reserve_status(Status::error("reserve error"));
        let unreserved = fake.unreserve_calls();
        let registry = registry_with(fake);
        let (handle, _) = test_handle();
        let profile = profile_with(ExtensionPoint::Reserve, &["FakeReserve"]);
        let framework = Framework::new(&registry, &profile, handle).unwrap();

        let pod = create_test_pod("foo", "default");
        let mut state = CycleState::new();
        let status = framework
            .run_reserve_plugins_reserve(&mut state, &pod, "machine1")
            .await;
        assert_eq!(status.code(), Code::Error);
        assert_eq!(
            status.message(),
            r#"running Reserve plugin "FakeReserve": reserve error"#
        );

        framework
            .run_reserve_plugins_unreserve(&mut state, &pod, "machine1")
            .await;
        assert_eq!(*unreserved.lock(), 1);
    }

    #[tokio::test]
    async fn test_permit_wait_then_allow() {
        let fake =
            FakePlugin::new("Gate").permit_status(Status::wait(), Duration::from_secs(30));
        let registry = registry_with(fake);
        let (handle, _) = test_handle();
        let waiting_pods = handle.waiting_pods().clone();
        let profile = profile_with(ExtensionPoint::Permit, &["Gate"]);
        let framework = Framework::new(&registry, &profile, handle).unwrap();

        let pod = create_test_pod("foo", "default");
        let state = CycleState::new();
        let status = framework.run_permit_plugins(&state, &pod, "machine1").await;
        assert_eq!(status.code(), Code::Wait);

        let waiting = waiting_pods.get("default/foo").unwrap();
        assert_eq!(waiting.pending_plugins(), vec!["Gate".to_string()]);
        waiting.allow("Gate");

        assert!(framework.wait_on_permit(&pod).await.is_success());
        assert!(waiting_pods.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_wait_is_capped() {
        let fake = FakePlugin::new("Forever")
            .permit_status(Status::wait(), Duration::from_secs(24 * 60 * 60));
        let registry = registry_with(fake);
        let (handle, _) = test_handle();
        let profile = profile_with(ExtensionPoint::Permit, &["Forever"]);
        let framework = Framework::new(&registry, &profile, handle).unwrap();

        let pod = create_test_pod("foo", "default");
        let state = CycleState::new();
        framework.run_permit_plugins(&state, &pod, "machine1").await;

        let started = tokio::time::Instant::now();
        let status = framework.wait_on_permit(&pod).await;
        assert!(status.is_unschedulable());
        assert!(started.elapsed() >= MAX_PERMIT_TIMEOUT);
        assert!(started.elapsed() < MAX_PERMIT_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bind_skip_when_no_binder_handles_pod() {
        let fake = FakePlugin::new("Picky").bind_status(Status::skip());
        let registry = registry_with(fake);
        let (handle, _) = test_handle();
        let profile = profile_with(ExtensionPoint::Bind, &["Picky"]);
        let framework = Framework::new(&registry, &profile, handle).unwrap();

        let pod = create_test_pod("foo", "default");
        let status = framework
            .run_bind_plugins(&CycleState::new(), &pod, "machine1")
            .await;
        assert_eq!(status.code(), Code::Skip);
    }
}
