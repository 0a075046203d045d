use crate::types::{GroupVersionKind, ResourceKey};
use crate::{BerthError, Node, Pod, Result};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A change notification emitted by the workload store on every mutation
///
/// Delivery is at-least-once; consumers must apply events idempotently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// Full key of the object (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The serialized object after the change (before it, for deletions)
    pub object: serde_json::Value,
    /// The object before the change, for modifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
}

impl ResourceEvent {
    fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        old_object: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            resource_key,
            object,
            old_object,
        }
    }

    /// Create an ADDED event for a pod
    pub fn pod_added(pod: &Pod) -> Result<Self> {
        Ok(Self::new(WatchEventType::Added, pod_resource_key(pod)?, to_value(pod)?, None))
    }

    /// Create a MODIFIED event for a pod
    pub fn pod_modified(old: &Pod, new: &Pod) -> Result<Self> {
        Ok(Self::new(
            WatchEventType::Modified,
            pod_resource_key(new)?,
            to_value(new)?,
            Some(to_value(old)?),
        ))
    }

    /// Create a DELETED event for a pod
    pub fn pod_deleted(pod: &Pod) -> Result<Self> {
        Ok(Self::new(WatchEventType::Deleted, pod_resource_key(pod)?, to_value(pod)?, None))
    }

    /// Create an ADDED event for a node
    pub fn node_added(node: &Node) -> Result<Self> {
        Ok(Self::new(WatchEventType::Added, node_resource_key(node)?, to_value(node)?, None))
    }

    /// Create a MODIFIED event for a node
    pub fn node_modified(old: &Node, new: &Node) -> Result<Self> {
        Ok(Self::new(
            WatchEventType::Modified,
            node_resource_key(new)?,
            to_value(new)?,
            Some(to_value(old)?),
        ))
    }

    /// Create a DELETED event for a node
    pub fn node_deleted(node: &Node) -> Result<Self> {
        Ok(Self::new(WatchEventType::Deleted, node_resource_key(node)?, to_value(node)?, None))
    }

    /// Decode the carried object
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        decode_value(&self.object)
    }

    /// Decode the previous object, if the event carries one
    pub fn decode_old<T: for<'de> Deserialize<'de>>(&self) -> Result<Option<T>> {
        self.old_object.as_ref().map(decode_value).transpose()
    }
}

fn pod_resource_key(pod: &Pod) -> Result<ResourceKey> {
    let name = pod
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| BerthError::missing_field("Pod", "metadata.name"))?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    Ok(ResourceKey::new(GroupVersionKind::pod(), namespace, name))
}

fn node_resource_key(node: &Node) -> Result<ResourceKey> {
    let name = node
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| BerthError::missing_field("Node", "metadata.name"))?;
    Ok(ResourceKey::cluster_scoped(GroupVersionKind::node(), name))
}

fn to_value<T: Serialize>(object: &T) -> Result<serde_json::Value> {
    serde_json::to_value(object).map_err(|e| {
        BerthError::serialization_error(
            format!("Failed to encode watch object: {}", e),
            Some(Box::new(e)),
        )
    })
}

fn decode_value<T: for<'de> Deserialize<'de>>(value: &serde_json::Value) -> Result<T> {
    T::deserialize(value).map_err(|e| {
        BerthError::serialization_error(
            format!("Failed to decode watch object: {}", e),
            Some(Box::new(e)),
        )
    })
}
