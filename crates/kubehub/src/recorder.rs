use std::time::Duration;

use curlme_core::{Event, EventRecorder, Severity};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter},
    Client,
};
use tracing::{debug, warn};

/// API server limit for `Event.reason`.
pub const MAX_REASON_LEN: usize = 128;

/// Publishes core events as Kubernetes Events on the ConfigMap.
///
/// `record` returns immediately; publishing happens on a spawned task bounded
/// by `timeout`, and failures are only logged.
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
    timeout: Duration,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: impl Into<String>, instance: Option<String>, timeout: Duration) -> Self {
        Self { client, reporter: Reporter { controller: controller.into(), instance }, timeout }
    }
}

pub(crate) fn object_reference(ev: &Event) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("ConfigMap".into()),
        namespace: Some(ev.key.namespace().to_string()),
        name: Some(ev.key.name().to_string()),
        uid: ev.uid.clone(),
        resource_version: ev.resource_version.clone(),
        ..Default::default()
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn kube_event(ev: &Event) -> KubeEvent {
    KubeEvent {
        type_: match ev.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        },
        reason: truncate(&ev.reason, MAX_REASON_LEN),
        note: Some(ev.message.clone()),
        action: "Reconcile".into(),
        secondary: None,
    }
}

impl EventRecorder for KubeRecorder {
    fn record(&self, event: Event) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(key = %event.key, reason = %event.reason, "no runtime to publish event on; dropping");
            return;
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(&event));
        let timeout = self.timeout;
        rt.spawn(async move {
            let kev = kube_event(&event);
            match tokio::time::timeout(timeout, recorder.publish(kev)).await {
                Ok(Ok(())) => {
                    metrics::counter!("events_published_total", 1u64);
                    debug!(key = %event.key, reason = %event.reason, "event published");
                }
                Ok(Err(e)) => warn!(key = %event.key, error = %e, "event publish failed"),
                Err(_) => warn!(key = %event.key, ?timeout, "event publish timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curlme_core::ObjectKey;

    #[test]
    fn reference_points_at_the_configmap() {
        let mut ev = Event::for_key(ObjectKey::new("ns", "cm1"), Severity::Warning, "r", "m");
        ev.uid = Some("u-1".into());
        let r = object_reference(&ev);
        assert_eq!(r.kind.as_deref(), Some("ConfigMap"));
        assert_eq!(r.api_version.as_deref(), Some("v1"));
        assert_eq!(r.namespace.as_deref(), Some("ns"));
        assert_eq!(r.name.as_deref(), Some("cm1"));
        assert_eq!(r.uid.as_deref(), Some("u-1"));
    }

    #[test]
    fn long_reasons_are_cut_on_char_boundaries() {
        let long = "é".repeat(100);
        let cut = truncate(&long, MAX_REASON_LEN);
        assert!(cut.len() <= MAX_REASON_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate("short", MAX_REASON_LEN), "short");
    }

    #[test]
    fn severity_maps_to_event_type() {
        let ev = Event::for_key(ObjectKey::new("ns", "cm1"), Severity::Warning, "connection refused", "boom");
        let k = kube_event(&ev);
        assert_eq!(k.type_, EventType::Warning);
        assert_eq!(k.reason, "connection refused");
        assert_eq!(k.note.as_deref(), Some("boom"));
    }
}
