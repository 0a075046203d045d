//! Built-in plugins

pub mod default_binder;
pub mod filter;
pub mod node_ports;
pub mod node_resources;
pub mod queue_sort;

pub use default_binder::DefaultBinder;
pub use filter::{NodeSelector, NodeUnschedulable, TaintToleration};
pub use node_ports::NodePorts;
pub use node_resources::NodeResourcesFit;
pub use queue_sort::PrioritySort;

use crate::config::{PluginSet, Plugins};
use crate::framework::{FrameworkHandle, Plugin, PluginFactory, Registry};
use std::sync::Arc;

/// Built-in plugins that also run at PreFilter
const PRE_FILTER_PLUGINS: &[&str] = &[NodeResourcesFit::NAME, NodePorts::NAME];

const FILTER_PLUGINS: &[&str] = &[
    NodeUnschedulable::NAME,
    NodeResourcesFit::NAME,
    NodeSelector::NAME,
    NodePorts::NAME,
    TaintToleration::NAME,
];

pub(crate) fn has_pre_filter(name: &str) -> bool {
    PRE_FILTER_PLUGINS.contains(&name)
}

fn stateless<P: Plugin + Default + 'static>() -> PluginFactory {
    Arc::new(|_: Option<&serde_json::Value>, _: &FrameworkHandle| Ok(Arc::new(P::default()) as Arc<dyn Plugin>))
}

/// Registry holding every built-in plugin
pub fn in_tree_registry() -> Registry {
    let mut registry = Registry::new();
    let builtins: Vec<(&str, PluginFactory)> = vec![
        (PrioritySort::NAME, stateless::<PrioritySort>()),
        (NodeUnschedulable::NAME, stateless::<NodeUnschedulable>()),
        (NodeResourcesFit::NAME, stateless::<NodeResourcesFit>()),
        (NodeSelector::NAME, stateless::<NodeSelector>()),
        (NodePorts::NAME, stateless::<NodePorts>()),
        (TaintToleration::NAME, stateless::<TaintToleration>()),
        (
            DefaultBinder::NAME,
            Arc::new(|_: Option<&serde_json::Value>, handle: &FrameworkHandle| {
                Ok(Arc::new(DefaultBinder::new(handle.client().clone())) as Arc<dyn Plugin>)
            }),
        ),
    ];
    for (name, factory) in builtins {
        registry.override_plugin(name, factory);
    }
    registry
}

fn enable(names: &[&str]) -> PluginSet {
    PluginSet {
        enabled: names.iter().map(|n| crate::config::PluginRef::new(*n)).collect(),
        disabled: Vec::new(),
    }
}

/// Plugins enabled in every profile unless the profile disables them
pub fn default_plugins() -> Plugins {
    Plugins {
        queue_sort: enable(&[PrioritySort::NAME]),
        pre_filter: enable(PRE_FILTER_PLUGINS),
        filter: enable(FILTER_PLUGINS),
        bind: enable(&[DefaultBinder::NAME]),
        ..Default::default()
    }
}
