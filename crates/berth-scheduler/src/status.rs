use crate::client::ClusterClient;
use crate::error::Result;
use berth_core::{pod_key, Pod, PodCondition, PodStatus};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::json;
use tracing::debug;

/// Condition type the scheduler owns
pub const POD_SCHEDULED: &str = "PodScheduled";
/// Condition reason for pods that do not fit
pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";
/// Condition reason for internal scheduling failures
pub const REASON_SCHEDULER_ERROR: &str = "SchedulerError";

/// A `PodScheduled=False` condition
pub fn unscheduled_condition(reason: &str, message: impl Into<String>) -> PodCondition {
    PodCondition {
        type_: POD_SCHEDULED.to_string(),
        status: "False".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        ..Default::default()
    }
}

/// Write `condition` into `status`, replacing the condition of the same type.
///
/// The last transition time is kept when the condition status did not change
/// and refreshed otherwise. Returns whether anything changed.
pub fn update_pod_condition(status: &mut PodStatus, condition: &PodCondition) -> bool {
    let mut condition = condition.clone();
    condition.last_transition_time = Some(Time(Utc::now()));

    let conditions = status.conditions.get_or_insert_with(Vec::new);
    let existing = match conditions.iter().position(|c| c.type_ == condition.type_) {
        Some(i) => &mut conditions[i],
        None => {
            conditions.push(condition);
            return true;
        }
    };

    if existing.status == condition.status {
        condition.last_transition_time = existing.last_transition_time.clone();
    }
    let unchanged = existing.status == condition.status
        && existing.reason == condition.reason
        && existing.message == condition.message
        && existing.last_probe_time == condition.last_probe_time
        && existing.last_transition_time == condition.last_transition_time;

    *existing = condition;
    !unchanged
}

/// Patch a pod's condition and nominated node with a minimal status patch.
///
/// Nothing is sent when the condition already matches and the nominated node
/// is unchanged (or not being set). Returns whether a patch was sent.
pub async fn update_pod(
    client: &dyn ClusterClient,
    pod: &Pod,
    condition: &PodCondition,
    nominated_node: Option<&str>,
) -> Result<bool> {
    let mut status = pod.status.clone().unwrap_or_default();
    let current_nominated = status.nominated_node_name.clone();

    let condition_changed = update_pod_condition(&mut status, condition);
    let nominated_changed = match nominated_node {
        Some(node) if !node.is_empty() => current_nominated.as_deref() != Some(node),
        _ => false,
    };
    if !condition_changed && !nominated_changed {
        debug!("Pod {} status already up to date", pod_key(pod));
        return Ok(false);
    }

    let updated = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == condition.type_)
        .cloned();

    let mut status_patch = serde_json::Map::new();
    if condition_changed {
        status_patch.insert("conditions".to_string(), json!([updated]));
    }
    if nominated_changed {
        status_patch.insert("nominatedNodeName".to_string(), json!(nominated_node));
    }
    let patch = json!({ "status": status_patch });

    client
        .patch_pod_status(
            pod.metadata.namespace.as_deref().unwrap_or(""),
            pod.metadata.name.as_deref().unwrap_or(""),
            &patch,
        )
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryCluster;
    use crate::test_util::create_test_pod;
    use chrono::Duration;

    fn pod_with_condition(condition: Option<PodCondition>, nominated: Option<&str>) -> Pod {
        let mut pod = create_test_pod("foo", "default");
        pod.status = Some(PodStatus {
            conditions: condition.map(|c| vec![c]),
            nominated_node_name: nominated.map(str::to_string),
            ..Default::default()
        });
        pod
    }

    fn old_time() -> Time {
        Time(Utc::now() - Duration::hours(1))
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut existing = unscheduled_condition(REASON_UNSCHEDULABLE, "0/1 nodes are available");
        existing.last_transition_time = Some(old_time());
        let mut status = PodStatus {
            conditions: Some(vec![existing.clone()]),
            ..Default::default()
        };

        let changed = update_pod_condition(
            &mut status,
            &unscheduled_condition(REASON_UNSCHEDULABLE, "0/2 nodes are available"),
        );
        assert!(changed);
        let condition = &status.conditions.unwrap()[0];
        assert_eq!(condition.message.as_deref(), Some("0/2 nodes are available"));
        assert_eq!(condition.last_transition_time, existing.last_transition_time);
    }

    #[test]
    fn test_status_change_refreshes_transition_time() {
        let mut existing = unscheduled_condition(REASON_UNSCHEDULABLE, "no fit");
        existing.last_transition_time = Some(old_time());
        let mut status = PodStatus {
            conditions: Some(vec![existing.clone()]),
            ..Default::default()
        };

        let scheduled = PodCondition {
            type_: POD_SCHEDULED.to_string(),
            status: "True".to_string(),
            ..Default::default()
        };
        assert!(update_pod_condition(&mut status, &scheduled));
        let condition = &status.conditions.unwrap()[0];
        assert!(condition.last_transition_time.as_ref().unwrap().0 > existing.last_transition_time.unwrap().0);
    }

    #[tokio::test]
    async fn test_update_pod_skips_identical_condition() {
        let cluster = InMemoryCluster::default();
        let mut existing = unscheduled_condition(REASON_UNSCHEDULABLE, "no fit");
        existing.last_transition_time = Some(old_time());
        let pod = pod_with_condition(Some(existing), Some("machine1"));
        cluster.add_pod(pod.clone()).await;

        let condition = unscheduled_condition(REASON_UNSCHEDULABLE, "no fit");
        assert!(!update_pod(&cluster, &pod, &condition, None).await.unwrap());
        assert!(!update_pod(&cluster, &pod, &condition, Some("machine1"))
            .await
            .unwrap());
        assert!(cluster.patch_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_pod_patches_changed_condition_only() {
        let cluster = InMemoryCluster::default();
        let mut existing = unscheduled_condition(REASON_UNSCHEDULABLE, "old message");
        existing.last_transition_time = Some(old_time());
        let pod = pod_with_condition(Some(existing.clone()), None);
        cluster.add_pod(pod.clone()).await;

        let condition = unscheduled_condition(REASON_UNSCHEDULABLE, "new message");
        assert!(update_pod(&cluster, &pod, &condition, None).await.unwrap());

        let patches = cluster.patch_requests().await;
        assert_eq!(patches.len(), 1);
        let status = &patches[0].patch["status"];
        assert!(status.get("nominatedNodeName").is_none());
        assert_eq!(status["conditions"][0]["message"], "new message");
        assert_eq!(
            status["conditions"][0]["lastTransitionTime"],
            serde_json::to_value(existing.last_transition_time).unwrap()
        );
    }

    #[tokio::test]
    async fn test_update_pod_sets_nominated_node() {
        let cluster = InMemoryCluster::default();
        let condition = unscheduled_condition(REASON_UNSCHEDULABLE, "no fit");
        let mut existing = condition.clone();
        existing.last_transition_time = Some(old_time());
        let pod = pod_with_condition(Some(existing), Some("machine1"));
        cluster.add_pod(pod.clone()).await;

        assert!(update_pod(&cluster, &pod, &condition, Some("machine2"))
            .await
            .unwrap());

        let patches = cluster.patch_requests().await;
        let status = &patches[0].patch["status"];
        assert_eq!(status["nominatedNodeName"], "machine2");
        assert!(status.get("conditions").is_none());

        let stored = cluster.get_pod("default", "foo").await.unwrap().unwrap();
        assert_eq!(
            stored.status.unwrap().nominated_node_name.as_deref(),
            Some("machine2")
        );
    }

    #[tokio::test]
    async fn test_update_pod_adds_missing_condition() {
        let cluster = InMemoryCluster::default();
        let pod = pod_with_condition(None, None);
        cluster.add_pod(pod.clone()).await;

        let condition = unscheduled_condition(REASON_SCHEDULER_ERROR, "boom");
        assert!(update_pod(&cluster, &pod, &condition, None).await.unwrap());

        let stored = cluster.get_pod("default", "foo").await.unwrap().unwrap();
        let conditions = stored.status.unwrap().conditions.unwrap();
        assert_eq!(conditions[0].type_, POD_SCHEDULED);
        assert_eq!(conditions[0].reason.as_deref(), Some("SchedulerError"));
    }
}
