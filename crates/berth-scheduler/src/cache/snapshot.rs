use super::NodeInfo;
use std::collections::HashMap;

/// Immutable point-in-time copy of the cache, one entry per known node
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<NodeInfo>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.node_name().map(|name| (name.to_string(), i)))
            .collect();
        Self { nodes, index }
    }

    pub fn get(&self, node_name: &str) -> Option<&NodeInfo> {
        self.index.get(node_name).map(|i| &self.nodes[*i])
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
