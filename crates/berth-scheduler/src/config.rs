use crate::error::{Result, SchedulerError};
use crate::framework::ExtensionPoint;
use crate::policy::Policy;
use berth_core::DEFAULT_SCHEDULER_NAME;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Plugin name that disables every default at an extension point
pub const DISABLE_ALL: &str = "*";

/// Top-level scheduler configuration document (YAML or JSON, camelCase keys)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfiguration {
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub extenders: Vec<ExtenderConfig>,
    /// Legacy policy document applied on top of the profiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,
    #[serde(default = "default_initial_backoff")]
    pub pod_initial_backoff_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub pod_max_backoff_seconds: u64,
    #[serde(default = "default_assumed_pod_ttl")]
    pub assumed_pod_ttl_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cache_cleanup_interval_seconds: u64,
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    10
}

fn default_assumed_pod_ttl() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    1
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            extenders: Vec::new(),
            policy_file: None,
            pod_initial_backoff_seconds: default_initial_backoff(),
            pod_max_backoff_seconds: default_max_backoff(),
            assumed_pod_ttl_seconds: default_assumed_pod_ttl(),
            cache_cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl SchedulerConfiguration {
    /// Parse a configuration document. JSON is accepted as YAML.
    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data).map_err(|e| {
            SchedulerError::invalid_configuration(
                format!("failed to parse configuration: {}", e),
                "Check the document against the SchedulerConfiguration fields (camelCase keys)",
            )
        })
    }

    /// Read and parse a configuration file, resolving `policyFile` relative to it
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::invalid_configuration(
                format!("failed to read {}: {}", path.display(), e),
                "Check that the configuration file exists and is readable",
            )
        })?;
        let mut config = Self::from_yaml(&data)?;
        if let (Some(policy), Some(dir)) = (config.policy_file.as_mut(), path.parent()) {
            if policy.is_relative() {
                *policy = dir.join(&*policy);
            }
        }
        Ok(config)
    }

    /// The configured profiles, or a single `default-scheduler` profile
    pub fn profiles_or_default(&self) -> Vec<ProfileConfig> {
        if self.profiles.is_empty() {
            vec![ProfileConfig::default()]
        } else {
            self.profiles.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pod_initial_backoff_seconds == 0 {
            return Err(SchedulerError::invalid_configuration(
                "podInitialBackoffSeconds must be positive",
                "Set podInitialBackoffSeconds to at least 1",
            ));
        }
        if self.pod_max_backoff_seconds < self.pod_initial_backoff_seconds {
            return Err(SchedulerError::invalid_configuration(
                "podMaxBackoffSeconds is smaller than podInitialBackoffSeconds",
                "Raise podMaxBackoffSeconds",
            ));
        }
        for profile in &self.profiles {
            if profile.scheduler_name.is_empty() {
                return Err(SchedulerError::invalid_configuration(
                    "profile with an empty schedulerName",
                    "Give every profile a schedulerName",
                ));
            }
        }
        validate_extenders(&self.extenders)
    }

    /// Fold a legacy policy into this configuration: its predicates replace
    /// the filter set of every profile and its extenders are appended.
    ///
    /// An empty predicate list leaves no filters, so every node is feasible.
    pub fn apply_policy(&mut self, policy: &Policy) -> Result<()> {
        let filters = policy.to_filter_plugins()?;
        if filters.is_empty() {
            warn!("Policy lists no predicates, all filter plugins are disabled");
        }
        let mut profiles = self.profiles_or_default();
        for profile in &mut profiles {
            let plugins = profile.plugins.get_or_insert_with(Plugins::default);
            plugins.filter = PluginSet::only(&filters);
            plugins.pre_filter = PluginSet::only(
                &filters
                    .iter()
                    .filter(|name| crate::plugins::has_pre_filter(name))
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }
        self.profiles = profiles;
        self.extenders.extend(policy.extenders.iter().cloned());
        validate_extenders(&self.extenders)
    }

    pub fn pod_initial_backoff(&self) -> Duration {
        Duration::from_secs(self.pod_initial_backoff_seconds)
    }

    pub fn pod_max_backoff(&self) -> Duration {
        Duration::from_secs(self.pod_max_backoff_seconds)
    }

    pub fn assumed_pod_ttl(&self) -> Duration {
        Duration::from_secs(self.assumed_pod_ttl_seconds)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_seconds)
    }
}

pub(crate) fn validate_extenders(extenders: &[ExtenderConfig]) -> Result<()> {
    let binders = extenders.iter().filter(|e| e.bind_verb.is_some()).count();
    if binders > 1 {
        return Err(SchedulerError::invalid_configuration(
            format!("{} extenders declare a bindVerb, only one may", binders),
            "Remove bindVerb from all but one extender",
        ));
    }
    for extender in extenders {
        if extender.url_prefix.is_empty() {
            return Err(SchedulerError::invalid_configuration(
                "extender with an empty urlPrefix",
                "Set urlPrefix to the extender's base URL",
            ));
        }
        if extender.weight <= 0 {
            return Err(SchedulerError::invalid_configuration(
                format!("extender {} has non-positive weight {}", extender.url_prefix, extender.weight),
                "Extender weights must be positive",
            ));
        }
    }
    Ok(())
}

/// One scheduling profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    /// Changes to the default plugin set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_config: Vec<PluginConfig>,
}

fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_string()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            scheduler_name: default_scheduler_name(),
            plugins: None,
            plugin_config: Vec::new(),
        }
    }
}

impl ProfileConfig {
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            ..Default::default()
        }
    }

    /// The default plugin set with this profile's changes merged over it
    pub fn effective_plugins(&self) -> Plugins {
        let defaults = crate::plugins::default_plugins();
        match &self.plugins {
            Some(custom) => defaults.merge(custom),
            None => defaults,
        }
    }
}

/// Arguments for one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Enabled and disabled plugins per extension point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugins {
    #[serde(default)]
    pub queue_sort: PluginSet,
    #[serde(default)]
    pub pre_filter: PluginSet,
    #[serde(default)]
    pub filter: PluginSet,
    #[serde(default)]
    pub reserve: PluginSet,
    #[serde(default)]
    pub permit: PluginSet,
    #[serde(default)]
    pub pre_bind: PluginSet,
    #[serde(default)]
    pub bind: PluginSet,
    #[serde(default)]
    pub post_bind: PluginSet,
}

impl Plugins {
    pub fn get(&self, point: ExtensionPoint) -> &PluginSet {
        match point {
            ExtensionPoint::QueueSort => &self.queue_sort,
            ExtensionPoint::PreFilter => &self.pre_filter,
            ExtensionPoint::Filter => &self.filter,
            ExtensionPoint::Reserve => &self.reserve,
            ExtensionPoint::Permit => &self.permit,
            ExtensionPoint::PreBind => &self.pre_bind,
            ExtensionPoint::Bind => &self.bind,
            ExtensionPoint::PostBind => &self.post_bind,
        }
    }

    pub fn get_mut(&mut self, point: ExtensionPoint) -> &mut PluginSet {
        match point {
            ExtensionPoint::QueueSort => &mut self.queue_sort,
            ExtensionPoint::PreFilter => &mut self.pre_filter,
            ExtensionPoint::Filter => &mut self.filter,
            ExtensionPoint::Reserve => &mut self.reserve,
            ExtensionPoint::Permit => &mut self.permit,
            ExtensionPoint::PreBind => &mut self.pre_bind,
            ExtensionPoint::Bind => &mut self.bind,
            ExtensionPoint::PostBind => &mut self.post_bind,
        }
    }

    /// Apply `custom` over `self` point by point
    pub fn merge(&self, custom: &Plugins) -> Plugins {
        let mut merged = Plugins::default();
        for point in ExtensionPoint::ALL {
            *merged.get_mut(point) = self.get(point).merge(custom.get(point));
        }
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<PluginRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<PluginRef>,
}

impl PluginSet {
    /// A set that enables exactly `names`, in order, and nothing else
    pub fn only(names: &[String]) -> Self {
        Self {
            enabled: names.iter().map(PluginRef::new).collect(),
            disabled: vec![PluginRef::new(DISABLE_ALL)],
        }
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.enabled.iter().map(|p| p.name.clone()).collect()
    }

    fn disables(&self, name: &str) -> bool {
        self.disabled
            .iter()
            .any(|p| p.name == DISABLE_ALL || p.name == name)
    }

    /// Defaults minus `custom.disabled`, followed by `custom.enabled`
    pub fn merge(&self, custom: &PluginSet) -> PluginSet {
        let mut enabled: Vec<PluginRef> = self
            .enabled
            .iter()
            .filter(|p| !custom.disables(&p.name))
            .cloned()
            .collect();
        for plugin in &custom.enabled {
            if !enabled.contains(plugin) {
                enabled.push(plugin.clone());
            }
        }
        PluginSet {
            enabled,
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
}

impl PluginRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An external HTTP extender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderConfig {
    pub url_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_verb: Option<String>,
    #[serde(default = "default_extender_weight")]
    pub weight: i64,
    #[serde(default = "default_extender_timeout")]
    pub http_timeout_seconds: u64,
    /// Only pods requesting one of these resources are sent to the extender
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_resources: Vec<ManagedResource>,
    /// Failures of an ignorable extender are skipped instead of failing the pod
    #[serde(default)]
    pub ignorable: bool,
}

fn default_extender_weight() -> i64 {
    1
}

fn default_extender_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub name: String,
    #[serde(default)]
    pub ignored_by_scheduler: bool,
}
