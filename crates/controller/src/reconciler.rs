use std::sync::Arc;
use std::time::{Duration, Instant};

use curlme_core::prelude::*;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

pub const REASON_SYNCED: &str = "Synced";
pub const MESSAGE_SYNCED: &str = "ConfigMap updated successfully";

/// One reconcile pass per key: read the cache, compute the desired state,
/// write it back when it differs. Holds no per-key state between calls.
pub struct Reconciler {
    cache: Arc<dyn CacheReader>,
    transform: Arc<dyn Transform>,
    store: Arc<dyn RemoteStore>,
    recorder: Arc<dyn EventRecorder>,
    write_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn CacheReader>,
        transform: Arc<dyn Transform>,
        store: Arc<dyn RemoteStore>,
        recorder: Arc<dyn EventRecorder>,
        write_timeout: Duration,
    ) -> Self {
        Self { cache, transform, store, recorder, write_timeout }
    }

    pub async fn reconcile(&self, key: &str) -> Outcome {
        let started = Instant::now();
        let outcome = self.reconcile_inner(key).await;
        counter!("reconcile_total", 1u64, "outcome" => outcome.label());
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn reconcile_inner(&self, raw: &str) -> Outcome {
        let key = match ObjectKey::parse(raw) {
            Ok(k) => k,
            Err(e) => {
                error!(key = raw, error = %e, "dropping undecodable key");
                return Outcome::PermanentFailure(e.into());
            }
        };

        let Some(cached) = self.cache.get(&key) else {
            debug!(key = %key, "not in cache; nothing to do");
            return Outcome::Unchanged;
        };

        // The cache entry is shared; work on a private copy.
        let desired = match self.transform.transform(Resource::clone(&cached)).await {
            Ok(None) => return Outcome::Unchanged,
            Ok(Some(r)) => r,
            Err(e) => {
                let msg = e.to_string();
                warn!(key = %key, error = %msg, "transform failed");
                self.recorder.record(Event::for_resource(&cached, Severity::Warning, msg.clone(), msg));
                return Outcome::TransientFailure(e.into());
            }
        };
        if desired == *cached {
            debug!(key = %key, "already up to date");
            return Outcome::Unchanged;
        }

        match tokio::time::timeout(self.write_timeout, self.store.update(&desired)).await {
            Ok(Ok(stored)) => {
                info!(key = %key, rv = ?stored.resource_version, "configmap updated");
                self.recorder.record(Event::for_resource(&stored, Severity::Normal, REASON_SYNCED, MESSAGE_SYNCED));
                Outcome::Updated
            }
            Ok(Err(e)) => {
                let err = ReconcileError::from(e);
                if err.is_conflict() {
                    warn!(key = %key, error = %err, "write conflict; will retry against fresh state");
                } else {
                    warn!(key = %key, error = %err, "update failed");
                }
                Outcome::TransientFailure(err)
            }
            Err(_) => {
                warn!(key = %key, timeout = ?self.write_timeout, "update timed out");
                Outcome::TransientFailure(ReconcileError::WriteTimeout(self.write_timeout))
            }
        }
    }
}
