use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use curlme_core::prelude::*;
use curlme_queue::WorkQueue;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Reconciler;

pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";

/// Retry policy applied by every worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPolicy {
    /// Give up on a key after this many rate-limited retries. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
}

/// Spawn `count` workers draining `queue` until it shuts down.
pub fn spawn_workers(
    count: usize,
    queue: Arc<WorkQueue<String>>,
    reconciler: Arc<Reconciler>,
    recorder: Arc<dyn EventRecorder>,
    policy: WorkerPolicy,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                debug!(worker = id, "worker started");
                while process_next_item(&queue, &reconciler, recorder.as_ref(), policy).await {}
                info!(worker = id, "worker stopped");
            })
        })
        .collect()
}

/// Take one key off the queue, reconcile it and settle its retry state.
/// Returns `false` once the queue is shut down and drained.
pub async fn process_next_item(
    queue: &WorkQueue<String>,
    reconciler: &Reconciler,
    recorder: &dyn EventRecorder,
    policy: WorkerPolicy,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let outcome = match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(key = %key, panic = %msg, "reconcile panicked");
            Outcome::TransientFailure(ReconcileError::Panicked(msg))
        }
    };

    match outcome {
        Outcome::Updated | Outcome::Unchanged | Outcome::PermanentFailure(_) => queue.forget(&key),
        Outcome::TransientFailure(err) => {
            let retries = queue.num_requeues(&key);
            match policy.max_retries {
                Some(max) if retries >= max => {
                    warn!(key = %key, retries, error = %err, "retries exhausted; dropping key");
                    queue.forget(&key);
                    if let Ok(k) = ObjectKey::parse(&key) {
                        let msg = format!("giving up after {} retries: {}", retries, err);
                        recorder.record(Event::for_key(k, Severity::Warning, REASON_RETRIES_EXHAUSTED, msg));
                    }
                }
                _ => {
                    debug!(key = %key, retries, "requeue with backoff");
                    queue.add_rate_limited(key.clone());
                }
            }
        }
    }
    queue.done(&key);
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curlme_core::mock::{MockRecorder, MockStore, MockTransform};
    use curlme_queue::rate_limiter::ItemExponentialFailureRateLimiter;
    use curlme_store::CacheHandle;
    use std::time::Duration;

    fn setup(transform: MockTransform) -> (Arc<WorkQueue<String>>, Arc<Reconciler>, Arc<MockRecorder>, Arc<MockStore>) {
        let cm = Resource::new("ns", "cm1").with_resource_version("1");
        let store = Arc::new(MockStore::with_resources([cm.clone()]));
        let cache = CacheHandle::from_resources(store.object(&cm.key()));
        let recorder = Arc::new(MockRecorder::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(cache),
            Arc::new(transform),
            store.clone(),
            recorder.clone(),
            Duration::from_secs(10),
        ));
        let limiter = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let queue = Arc::new(WorkQueue::new(Box::new(limiter)));
        (queue, reconciler, recorder, store)
    }

    #[tokio::test]
    async fn success_forgets_failures() {
        let (queue, reconciler, recorder, store) =
            setup(MockTransform::new(|r: Resource| Ok(Some(r.with_data("greeting", "hi")))));
        queue.add_rate_limited("ns/cm1".to_string());
        assert_eq!(queue.num_requeues(&"ns/cm1".to_string()), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(process_next_item(&queue, &reconciler, recorder.as_ref(), WorkerPolicy::default()).await);
        assert_eq!(queue.num_requeues(&"ns/cm1".to_string()), 0);
        assert_eq!(store.updates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_give_up() {
        let (queue, reconciler, recorder, _store) =
            setup(MockTransform::new(|_| Err(TransformError::Fetch("connection refused".into()))));
        let policy = WorkerPolicy { max_retries: Some(2) };
        queue.add("ns/cm1".to_string());

        for expected in 1..=2u32 {
            assert!(process_next_item(&queue, &reconciler, recorder.as_ref(), policy).await);
            assert_eq!(queue.num_requeues(&"ns/cm1".to_string()), expected);
        }
        // Third failure hits the limit: dropped, not requeued.
        assert!(process_next_item(&queue, &reconciler, recorder.as_ref(), policy).await);
        assert_eq!(queue.num_requeues(&"ns/cm1".to_string()), 0);
        assert!(queue.is_empty());

        let events = recorder.events();
        assert_eq!(events.len(), 4, "three transform warnings plus the final one");
        let last = events.last().unwrap();
        assert_eq!(last.reason, REASON_RETRIES_EXHAUSTED);
        assert_eq!(last.severity, Severity::Warning);
        assert!(last.message.contains("connection refused"));

        queue.shut_down();
        assert!(!process_next_item(&queue, &reconciler, recorder.as_ref(), policy).await);
    }

    #[tokio::test]
    async fn malformed_keys_are_dropped() {
        let (queue, reconciler, recorder, _store) = setup(MockTransform::new(|_| Ok(None)));
        queue.add("garbage".to_string());
        assert!(process_next_item(&queue, &reconciler, recorder.as_ref(), WorkerPolicy::default()).await);
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&"garbage".to_string()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_retried_and_the_worker_survives() {
        let (queue, reconciler, recorder, _store) = setup(MockTransform::new(|_| panic!("boom")));
        queue.add("ns/cm1".to_string());
        assert!(process_next_item(&queue, &reconciler, recorder.as_ref(), WorkerPolicy::default()).await);
        assert_eq!(queue.num_requeues(&"ns/cm1".to_string()), 1);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }
}
