//! curlme controller: the reconciler, the worker pool and the lifecycle that
//! wires feed, cache, queue and workers together.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use curlme_core::{ChangeFeed, EventRecorder, RemoteStore, Transform};
use curlme_queue::{controller_rate_limiter, WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS};
use curlme_store::{spawn_notifier, CacheHandle, NotifierConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod reconciler;
mod workers;

pub use reconciler::{Reconciler, MESSAGE_SYNCED, REASON_SYNCED};
pub use workers::{process_next_item, spawn_workers, WorkerPolicy, REASON_RETRIES_EXHAUSTED};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Bound on a single remote write.
    pub request_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
    pub max_retries: Option<u32>,
    pub resync: Option<Duration>,
    pub channel_cap: usize,
    pub cache_sync_timeout: Duration,
    /// Grace period for in-flight reconciles on stop. Must exceed the worst
    /// single reconcile (fetch plus write, each up to `request_timeout`) or a
    /// write can be cut off; the default is twice the request timeout plus
    /// five seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let request_timeout = Duration::from_secs(10);
        Self {
            workers: 2,
            request_timeout,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
            max_retries: None,
            resync: None,
            channel_cap: 2048,
            cache_sync_timeout: Duration::from_secs(120),
            shutdown_timeout: request_timeout * 2 + Duration::from_secs(5),
        }
    }
}

struct Running {
    queue: Arc<WorkQueue<String>>,
    cache: CacheHandle,
    feed: JoinHandle<()>,
    notifier: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the collaborators and the tasks started from them.
pub struct Controller {
    cfg: ControllerConfig,
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn RemoteStore>,
    transform: Arc<dyn Transform>,
    recorder: Arc<dyn EventRecorder>,
    ready_tx: watch::Sender<bool>,
    running: Option<Running>,
}

impl Controller {
    pub fn new(
        cfg: ControllerConfig,
        feed: Arc<dyn ChangeFeed>,
        store: Arc<dyn RemoteStore>,
        transform: Arc<dyn Transform>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self { cfg, feed, store, transform, recorder, ready_tx, running: None }
    }

    /// Flips to `true` once workers run and back to `false` on stop.
    pub fn readiness(&self) -> watch::Receiver<bool> { self.ready_tx.subscribe() }

    /// Read access to the cache while running.
    pub fn cache(&self) -> Option<CacheHandle> { self.running.as_ref().map(|r| r.cache.clone()) }

    /// Start the feed, wait for the first full listing, then launch workers.
    ///
    /// The feed and notifier are owned by the controller as soon as they are
    /// spawned, so `stop` tears them down even if this future is dropped
    /// while waiting for the cache.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("controller already started");
        }
        let cfg = self.cfg.clone();
        let limiter = controller_rate_limiter(cfg.base_delay, cfg.max_delay, cfg.qps, cfg.burst);
        let queue = Arc::new(WorkQueue::new(Box::new(limiter)));
        let ncfg = NotifierConfig { channel_cap: cfg.channel_cap, resync: cfg.resync, ..NotifierConfig::default() };
        let (tx, cache, notifier) = spawn_notifier(ncfg, Arc::clone(&queue));

        let source = Arc::clone(&self.feed);
        let feed = tokio::spawn(async move {
            match source.run(tx).await {
                Ok(()) => info!("change feed ended"),
                Err(e) => error!(error = %e, "change feed failed"),
            }
        });
        self.running =
            Some(Running { queue: Arc::clone(&queue), cache: cache.clone(), feed, notifier, workers: Vec::new() });

        info!(timeout = ?cfg.cache_sync_timeout, "waiting for cache sync");
        if !cache.wait_for_sync(cfg.cache_sync_timeout).await {
            self.stop().await?;
            bail!("cache did not sync within {:?}", cfg.cache_sync_timeout);
        }

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(cache.clone()),
            Arc::clone(&self.transform),
            Arc::clone(&self.store),
            Arc::clone(&self.recorder),
            cfg.request_timeout,
        ));
        let policy = WorkerPolicy { max_retries: cfg.max_retries };
        let workers = spawn_workers(cfg.workers, queue, reconciler, Arc::clone(&self.recorder), policy);
        info!(workers = workers.len(), objects = cache.len(), "controller running");

        if let Some(run) = self.running.as_mut() {
            run.workers = workers;
        }
        self.ready_tx.send_replace(true);
        Ok(())
    }

    /// Stop the feed and the queue, let workers finish what they hold, then
    /// wait for the notifier. Workers still busy after `shutdown_timeout` are
    /// aborted. Calling this on a stopped controller is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(run) = self.running.take() else {
            return Ok(());
        };
        self.ready_tx.send_replace(false);
        info!(queued = run.queue.len(), "controller stopping");

        run.feed.abort();
        run.queue.shut_down();

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_timeout;
        let mut aborted = 0usize;
        for mut w in run.workers {
            match tokio::time::timeout_at(deadline, &mut w).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker task failed"),
                Err(_) => {
                    w.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            warn!(aborted, timeout = ?self.cfg.shutdown_timeout, "workers did not finish in time");
        }

        // Dropping the feed closes the change channel, which ends the notifier.
        let _ = run.feed.await;
        if let Err(e) = run.notifier.await {
            warn!(error = %e, "notifier task failed");
        }
        info!("controller stopped");
        Ok(())
    }
}
