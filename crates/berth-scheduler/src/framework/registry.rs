use super::interface::Plugin;
use super::FrameworkHandle;
use crate::error::{Result, SchedulerError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a plugin from its optional arguments and the framework handle
pub type PluginFactory = Arc<
    dyn Fn(Option<&serde_json::Value>, &FrameworkHandle) -> Result<Arc<dyn Plugin>> + Send + Sync,
>;

/// Plugin name to factory mapping
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, PluginFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory; fails if the name is taken
    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(SchedulerError::PluginNameConflict { name });
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Add or replace a factory
    pub fn override_plugin(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Merge another registry; any shared name is an error and nothing is merged
    pub fn merge(&mut self, other: &Registry) -> Result<()> {
        if let Some(name) = other.factories.keys().find(|n| self.factories.contains_key(*n)) {
            return Err(SchedulerError::PluginNameConflict { name: name.clone() });
        }
        for (name, factory) in &other.factories {
            self.factories.insert(name.clone(), factory.clone());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
