use crate::config::ProfileConfig;
use crate::error::{Result, SchedulerError};
use crate::extender::Extender;
use crate::framework::{Framework, FrameworkHandle, QueueSortPlugin, Registry};
use crate::recorder::{EventRecorder, EventSink};
use berth_core::{scheduler_name, Pod};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A named pipeline together with its event recorder and binder chain
pub struct Profile {
    framework: Framework,
    recorder: EventRecorder,
    extenders: Vec<Arc<dyn Extender>>,
}

impl Profile {
    pub fn new(framework: Framework, recorder: EventRecorder, extenders: Vec<Arc<dyn Extender>>) -> Self {
        Self {
            framework,
            recorder,
            extenders,
        }
    }

    /// The scheduler name pods use to select this profile
    pub fn name(&self) -> &str {
        self.framework.profile_name()
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn extenders(&self) -> &[Arc<dyn Extender>] {
        &self.extenders
    }

    /// The extender that binds this pod instead of the Bind plugins, if any
    pub fn binder_extender(&self, pod: &Pod) -> Option<&Arc<dyn Extender>> {
        self.extenders
            .iter()
            .find(|e| e.is_binder() && e.is_interested(pod))
    }
}

/// Profiles keyed by scheduler name. Immutable once built.
pub struct ProfileMap {
    profiles: BTreeMap<String, Arc<Profile>>,
}

impl ProfileMap {
    pub fn new(
        configs: &[ProfileConfig],
        registry: &Registry,
        handle: &FrameworkHandle,
        sink: Arc<dyn EventSink>,
        extenders: Vec<Arc<dyn Extender>>,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(SchedulerError::invalid_configuration(
                "at least one profile is required",
                "Omit profiles entirely to get the default-scheduler profile",
            ));
        }

        let mut profiles = BTreeMap::new();
        let mut queue_sort: Option<(String, Option<String>)> = None;
        for config in configs {
            if profiles.contains_key(&config.scheduler_name) {
                return Err(SchedulerError::DuplicateProfile {
                    name: config.scheduler_name.clone(),
                });
            }

            let framework = Framework::new(registry, config, handle.clone())?;
            let sort_name = framework.queue_sort_name().map(str::to_string);
            match &queue_sort {
                None => queue_sort = Some((config.scheduler_name.clone(), sort_name)),
                Some((first, first_sort)) if *first_sort != sort_name => {
                    return Err(SchedulerError::invalid_configuration(
                        format!(
                            "profile {} uses queue sort {:?} but profile {} uses {:?}",
                            config.scheduler_name, sort_name, first, first_sort
                        ),
                        "All profiles share one queue, so they must use the same QueueSort plugin",
                    ));
                }
                Some(_) => {}
            }

            let recorder = EventRecorder::new(sink.clone(), config.scheduler_name.clone());
            info!("Built scheduling profile {}", config.scheduler_name);
            profiles.insert(
                config.scheduler_name.clone(),
                Arc::new(Profile::new(framework, recorder, extenders.clone())),
            );
        }

        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Profile>> {
        self.profiles.get(name)
    }

    /// The profile named by the pod's scheduler name
    pub fn for_pod(&self, pod: &Pod) -> Option<&Arc<Profile>> {
        self.get(scheduler_name(pod))
    }

    pub fn handles_pod(&self, pod: &Pod) -> bool {
        self.for_pod(pod).is_some()
    }

    /// The QueueSort plugin shared by all profiles
    pub fn queue_sort(&self) -> Option<Arc<dyn QueueSortPlugin>> {
        self.profiles
            .values()
            .next()
            .and_then(|p| p.framework().queue_sort())
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Profile>> {
        self.profiles.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginSet, Plugins};
    use crate::plugins::in_tree_registry;
    use crate::recorder::BroadcastEventSink;
    use crate::test_util::{create_test_pod, test_handle, with_scheduler_name};

    fn build(configs: &[ProfileConfig]) -> Result<ProfileMap> {
        let (handle, _) = test_handle();
        ProfileMap::new(
            configs,
            &in_tree_registry(),
            &handle,
            Arc::new(BroadcastEventSink::default()),
            Vec::new(),
        )
    }

    #[test]
    fn test_lookup_by_scheduler_name() {
        let profiles = build(&[
            ProfileConfig::new("match-machine2"),
            ProfileConfig::new("match-machine3"),
        ])
        .unwrap();

        assert_eq!(profiles.names(), vec!["match-machine2", "match-machine3"]);
        let pod = with_scheduler_name(create_test_pod("foo", "default"), "match-machine3");
        assert_eq!(profiles.for_pod(&pod).unwrap().name(), "match-machine3");
        assert_eq!(
            profiles.for_pod(&pod).unwrap().recorder().reporting_component(),
            "match-machine3"
        );

        // No profile for the default scheduler name
        assert!(!profiles.handles_pod(&create_test_pod("bar", "default")));
        assert!(profiles.queue_sort().is_some());
    }

    #[test]
    fn test_duplicate_profile_is_fatal() {
        let err = build(&[ProfileConfig::new("dup"), ProfileConfig::new("dup")])
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::DuplicateProfile { name } if name == "dup"));
    }

    #[test]
    fn test_empty_profile_list_is_fatal() {
        assert!(build(&[]).is_err());
    }

    #[test]
    fn test_mismatched_queue_sort_is_fatal() {
        let mut fifo = ProfileConfig::new("fifo");
        fifo.plugins = Some(Plugins {
            queue_sort: PluginSet::only(&[]),
            ..Default::default()
        });

        let err = build(&[ProfileConfig::new("sorted"), fifo]).err().unwrap();
        assert!(matches!(err, SchedulerError::InvalidConfiguration { .. }));
    }
}
