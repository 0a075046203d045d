use berth_core::{Event, Pod};
use chrono::Utc;
use k8s_openapi::api::core::v1::{EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Reason recorded when a pod is bound
pub const REASON_SCHEDULED: &str = "Scheduled";
/// Reason recorded for every scheduling failure
pub const REASON_FAILED_SCHEDULING: &str = "FailedScheduling";

const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Destination for recorded events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Fans events out to every subscriber
pub struct BroadcastEventSink {
    tx: broadcast::Sender<Event>,
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: Event) {
        // Dropped when nobody listens
        let _ = self.tx.send(event);
    }
}

/// Records events on behalf of one profile
#[derive(Clone)]
pub struct EventRecorder {
    sink: Arc<dyn EventSink>,
    reporting_component: String,
}

impl EventRecorder {
    pub fn new(sink: Arc<dyn EventSink>, reporting_component: impl Into<String>) -> Self {
        Self {
            sink,
            reporting_component: reporting_component.into(),
        }
    }

    /// Scheduler name of the profile this recorder reports for
    pub fn reporting_component(&self) -> &str {
        &self.reporting_component
    }

    /// Record an event about a pod
    pub fn event(&self, pod: &Pod, event_type: EventType, reason: &str, message: impl Into<String>) {
        let now = Utc::now();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let message = message.into();
        trace!("Recording {} event {} for {}: {}", event_type, reason, pod_name, message);

        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", pod_name, Uuid::new_v4().simple())),
                namespace: pod.metadata.namespace.clone(),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(event_type.to_string()),
            action: Some("Scheduling".to_string()),
            source: Some(EventSource {
                component: Some(self.reporting_component.clone()),
                host: None,
            }),
            reporting_component: Some(self.reporting_component.clone()),
            reporting_instance: Some(self.reporting_component.clone()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        };
        self.sink.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::create_test_pod;

    #[tokio::test]
    async fn test_event_names_pod_and_profile() {
        let sink = Arc::new(BroadcastEventSink::default());
        let mut rx = sink.subscribe();
        let recorder = EventRecorder::new(sink, "match-machine2");

        let pod = create_test_pod("foo", "default");
        recorder.event(
            &pod,
            EventType::Normal,
            REASON_SCHEDULED,
            "Successfully assigned default/foo to machine2",
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.reason.as_deref(), Some("Scheduled"));
        assert_eq!(event.type_.as_deref(), Some("Normal"));
        assert_eq!(event.reporting_component.as_deref(), Some("match-machine2"));
        assert_eq!(event.involved_object.name.as_deref(), Some("foo"));
        assert_eq!(event.involved_object.uid.as_deref(), Some("foo-uid"));
        assert!(event.metadata.name.unwrap().starts_with("foo."));
    }
}
