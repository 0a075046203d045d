//! Berth Core - Shared types for the Berth placement engine
//!
//! This crate provides:
//! - Pod and node helpers (keys, scheduler names, requests, host ports)
//! - Resource quantity parsing
//! - Watch notification types shared by the workload store and the scheduler
//! - Error types with miette diagnostics
//! - Serialization helpers

pub mod error;
pub mod events;
pub mod resources;
pub mod types;

use serde::Deserialize;

// Re-export commonly used types
pub use error::{BerthError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use resources::{
    host_ports, is_assigned, is_terminating, node_name, pod_key, pod_requests, scheduler_name,
    HostPort, ResourceQuantities, DEFAULT_SCHEDULER_NAME,
};
pub use types::{GroupVersionKind, ResourceKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Binding, Event, Node, Pod, PodCondition, PodStatus};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Deserialize a resource from YAML (JSON documents are accepted too)
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        BerthError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Split a multi-document YAML stream into untyped values.
///
/// Empty documents (e.g. a trailing `---`) are skipped.
pub fn yaml_documents(data: &str) -> Result<Vec<serde_json::Value>> {
    let mut values = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            BerthError::serialization_error(
                format!("Failed to parse YAML document: {}", e),
                Some(Box::new(e)),
            )
        })?;
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_accepts_json_pod() {
        let pod: Pod = from_yaml(
            r#"{"metadata": {"name": "nginx"}, "spec": {"schedulerName": "batch", "containers": []}}"#,
        )
        .unwrap();
        assert_eq!(scheduler_name(&pod), "batch");
    }

    #[test]
    fn test_yaml_documents() {
        let data = r#"
apiVersion: v1
kind: Node
metadata:
  name: machine1
---
apiVersion: v1
kind: Pod
metadata:
  name: foo
  namespace: default
---
"#;
        let docs = yaml_documents(data).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "Node");
        assert_eq!(docs[1]["metadata"]["name"], "foo");
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        let result: Result<Pod> = from_yaml("metadata: [unterminated");
        assert!(matches!(result, Err(BerthError::SerializationError { .. })));
    }
}
