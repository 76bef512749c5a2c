//! curlme store: eventually-consistent resource cache and the change
//! notifier that feeds it and the work queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use curlme_core::{CacheReader, ChangeEvent, ObjectKey, Resource};
use curlme_queue::WorkQueue;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

enum Pending {
    Upsert(Resource),
    Remove,
}

/// Coalescing buffer keyed by resource key: last event wins, FIFO by first
/// sighting.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, Pending>,
    order: VecDeque<ObjectKey>,
}

impl Default for Coalescer {
    fn default() -> Self { Self::new() }
}

impl Coalescer {
    pub fn new() -> Self { Self { map: FxHashMap::default(), order: VecDeque::new() } }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push_applied(&mut self, r: Resource) { self.push(r.key(), Pending::Upsert(r)); }

    pub fn push_deleted(&mut self, key: ObjectKey) { self.push(key, Pending::Remove); }

    fn push(&mut self, key: ObjectKey, p: Pending) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, p);
    }

    fn drain_ready(&mut self) -> Vec<(ObjectKey, Pending)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(p) = self.map.remove(&key) {
                out.push((key, p));
            }
        }
        out
    }
}

/// Immutable view of the cache at one epoch.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ObjectKey, Arc<Resource>>,
}

/// Single-writer builder behind the published snapshots.
pub struct CacheBuilder {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<Resource>>,
}

impl Default for CacheBuilder {
    fn default() -> Self { Self::new() }
}

impl CacheBuilder {
    pub fn new() -> Self { Self { epoch: 0, items: FxHashMap::default() } }

    fn upsert(&mut self, r: Resource) -> Option<ObjectKey> {
        let key = r.key();
        if let Some(cur) = self.items.get(&key) {
            if let (Some(have), Some(got)) = (cur.version_number(), r.version_number()) {
                if got < have {
                    trace!(key = %key, have, got, "ignoring stale resource version");
                    return None;
                }
            }
        }
        self.items.insert(key.clone(), Arc::new(r));
        Some(key)
    }

    /// Apply a coalesced batch; returns the keys that need reconciling.
    fn apply(&mut self, batch: Vec<(ObjectKey, Pending)>) -> Vec<ObjectKey> {
        let mut touched = Vec::with_capacity(batch.len());
        for (key, p) in batch {
            match p {
                Pending::Upsert(r) => touched.extend(self.upsert(r)),
                Pending::Remove => {
                    self.items.remove(&key);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        touched
    }

    /// Replace the whole cache with a relist; every listed key is returned.
    fn relist(&mut self, list: Vec<Resource>) -> Vec<ObjectKey> {
        let mut next: FxHashMap<ObjectKey, Arc<Resource>> = FxHashMap::default();
        let mut keys = Vec::with_capacity(list.len());
        for r in list {
            let key = r.key();
            keys.push(key.clone());
            next.insert(key, Arc::new(r));
        }
        let removed = self.items.keys().filter(|k| !next.contains_key(*k)).count();
        if removed > 0 {
            debug!(removed, "relist dropped vanished resources");
        }
        self.items = next;
        self.epoch = self.epoch.saturating_add(1);
        keys
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Read handle over the published snapshot.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
}

impl CacheHandle {
    /// A cache pre-populated with `items` and already marked synced.
    pub fn from_resources(items: impl IntoIterator<Item = Resource>) -> Self {
        let mut b = CacheBuilder::new();
        b.relist(items.into_iter().collect());
        let (_epoch_tx, epoch_rx) = watch::channel(b.epoch);
        let (_synced_tx, synced_rx) = watch::channel(true);
        Self { snap: Arc::new(ArcSwap::new(b.freeze())), epoch_rx, synced_rx }
    }

    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }

    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn len(&self) -> usize { self.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<ObjectKey> { self.snap.load().items.keys().cloned().collect() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// True once the first full listing has been applied.
    pub fn has_synced(&self) -> bool { *self.synced_rx.borrow() }

    /// Wait for the first full listing. Returns false on timeout or if the
    /// notifier exited before syncing.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced_rx.clone();
        let synced = matches!(tokio::time::timeout(timeout, rx.wait_for(|s| *s)).await, Ok(Ok(_)));
        synced
    }
}

impl CacheReader for CacheHandle {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Resource>> {
        self.snap.load().items.get(key).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Capacity of the change-event channel.
    pub channel_cap: usize,
    /// How often coalesced events are applied.
    pub batch_interval: Duration,
    /// Re-enqueue every cached key at this interval, if set.
    pub resync: Option<Duration>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { channel_cap: 2048, batch_interval: Duration::from_millis(8), resync: None }
    }
}

struct Notifier {
    builder: CacheBuilder,
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
    queue: Arc<WorkQueue<String>>,
}

impl Notifier {
    /// Publish the builder state, then enqueue `keys`. Enqueueing after the
    /// swap guarantees a worker sees at least this state.
    fn publish(&mut self, keys: Vec<ObjectKey>) {
        let next = self.builder.freeze();
        let epoch = next.epoch;
        let size = next.items.len();
        self.snap.store(next);
        let _ = self.epoch_tx.send(epoch);
        metrics::gauge!("cache_objects", size as f64);
        for k in keys {
            self.queue.add(k.to_string());
        }
    }

    fn flush(&mut self, coalescer: &mut Coalescer) {
        if coalescer.is_empty() {
            return;
        }
        let batch = coalescer.drain_ready();
        let keys = self.builder.apply(batch);
        self.publish(keys);
    }

    fn relist(&mut self, coalescer: &mut Coalescer, list: Vec<Resource>) {
        // Pending events predate the relist; apply them first so order holds.
        self.flush(coalescer);
        let count = list.len();
        let keys = self.builder.relist(list);
        self.publish(keys);
        if !*self.synced_tx.borrow() {
            info!(count, "cache synced");
            let _ = self.synced_tx.send(true);
        } else {
            debug!(count, "relist applied");
        }
    }

    fn resync(&self) {
        let snap = self.snap.load();
        debug!(count = snap.items.len(), "periodic resync");
        for k in snap.items.keys() {
            self.queue.add(k.to_string());
        }
    }
}

/// Spawn the change notifier: the only writer of the cache. It consumes
/// change events, publishes cache snapshots, and enqueues the keys of changed
/// resources (never the resources themselves). Deletions update the cache but
/// are not enqueued.
///
/// The loop exits once every sender is dropped.
pub fn spawn_notifier(
    cfg: NotifierConfig,
    queue: Arc<WorkQueue<String>>,
) -> (mpsc::Sender<ChangeEvent>, CacheHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ChangeEvent>(cfg.channel_cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (synced_tx, synced_rx) = watch::channel(false);
    let handle = CacheHandle { snap: Arc::clone(&snap), epoch_rx, synced_rx };

    let mut notifier = Notifier { builder: CacheBuilder::new(), snap, epoch_tx, synced_tx, queue };
    let task = tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut ticker = tokio::time::interval(cfg.batch_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let resync_every = cfg.resync.filter(|d| !d.is_zero());
        let mut resync = resync_every.map(|d| tokio::time::interval_at(tokio::time::Instant::now() + d, d));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(ChangeEvent::Applied(r)) => coalescer.push_applied(r),
                        Some(ChangeEvent::Deleted(k)) => coalescer.push_deleted(k),
                        Some(ChangeEvent::Restarted(list)) => notifier.relist(&mut coalescer, list),
                        None => {
                            debug!("change channel closed; draining and exiting notifier");
                            notifier.flush(&mut coalescer);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => notifier.flush(&mut coalescer),
                _ = async {
                    match resync.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => notifier.resync(),
            }
        }
        info!("notifier stopped");
    });

    (tx, handle, task)
}
