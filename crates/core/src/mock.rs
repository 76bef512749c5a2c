//! In-memory collaborators for tests and local runs.
//!
//! `MockStore` doubles as a change feed: it relists on subscribe and pushes an
//! `Applied` event for every successful update, so a controller wired against
//! it converges the same way it would against a real API server.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::{
    ChangeEvent, ChangeFeed, Event, EventRecorder, ObjectKey, RemoteStore, Resource, StoreError, Transform,
    TransformError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, Resource>,
    watchers: Vec<mpsc::Sender<ChangeEvent>>,
    fail_next: VecDeque<StoreError>,
}

/// Remote store held in memory with numeric resource versions.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
    updates: AtomicUsize,
    next_rv: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_resources(items: impl IntoIterator<Item = Resource>) -> Self {
        let me = Self::new();
        for r in items { me.insert(r); }
        me
    }

    /// Insert or replace an object, assigning it a fresh resource version.
    pub fn insert(&self, mut resource: Resource) {
        let rv = self.next_rv.fetch_add(1, Ordering::SeqCst) + 1;
        resource.resource_version = Some(rv.to_string());
        let mut st = lock(&self.state);
        st.objects.insert(resource.key(), resource.clone());
        broadcast(&mut st.watchers, ChangeEvent::Applied(resource));
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Resource> {
        lock(&self.state).objects.get(key).cloned()
    }

    /// Number of successful updates so far.
    pub fn updates(&self) -> usize { self.updates.load(Ordering::SeqCst) }

    /// Make the next update fail with `err`.
    pub fn fail_next(&self, err: StoreError) {
        lock(&self.state).fail_next.push_back(err);
    }
}

fn broadcast(watchers: &mut Vec<mpsc::Sender<ChangeEvent>>, ev: ChangeEvent) {
    watchers.retain(|w| !w.is_closed());
    for w in watchers.iter() {
        let _ = w.try_send(ev.clone());
    }
}

#[async_trait::async_trait]
impl RemoteStore for MockStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource>, StoreError> {
        Ok(self.object(key))
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let mut st = lock(&self.state);
        if let Some(err) = st.fail_next.pop_front() {
            return Err(err);
        }
        let key = resource.key();
        let current = st.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if resource.resource_version.is_some() && current.resource_version != resource.resource_version {
            return Err(StoreError::Conflict(format!(
                "{}: resource version {:?} is stale (current {:?})",
                key, resource.resource_version, current.resource_version
            )));
        }
        let rv = self.next_rv.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = resource.clone();
        stored.resource_version = Some(rv.to_string());
        st.objects.insert(key, stored.clone());
        broadcast(&mut st.watchers, ChangeEvent::Applied(stored.clone()));
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MockStore {
    async fn run(&self, tx: mpsc::Sender<ChangeEvent>) -> anyhow::Result<()> {
        // The store keeps only its own sender; `tx` lives in this future, so
        // dropping the feed closes the consumer's channel.
        let (wtx, mut wrx) = mpsc::channel(1024);
        {
            // Relist and subscribe under one lock so no update slips in between.
            let mut st = lock(&self.state);
            let list = st.objects.values().cloned().collect();
            if tx.try_send(ChangeEvent::Restarted(list)).is_err() {
                return Ok(());
            }
            st.watchers.push(wtx);
        }
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                ev = wrx.recv() => match ev {
                    Some(ev) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

/// Records events in memory and lets tests wait for them.
pub struct MockRecorder {
    events: Mutex<Vec<Event>>,
    count: watch::Sender<usize>,
}

impl Default for MockRecorder {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self { events: Mutex::new(Vec::new()), count }
    }
}

impl MockRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<Event> { lock(&self.events).clone() }

    /// Wait until at least `n` events were recorded or `timeout` passes, then
    /// return whatever has been recorded.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Event> {
        let mut rx = self.count.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|c| *c >= n)).await;
        self.events()
    }
}

impl EventRecorder for MockRecorder {
    fn record(&self, event: Event) {
        let len = {
            let mut events = lock(&self.events);
            events.push(event);
            events.len()
        };
        self.count.send_replace(len);
    }
}

type TransformFn = dyn Fn(Resource) -> Result<Option<Resource>, TransformError> + Send + Sync;

/// Transform backed by a closure; counts invocations.
pub struct MockTransform {
    f: Box<TransformFn>,
    calls: AtomicUsize,
}

impl MockTransform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Resource) -> Result<Option<Resource>, TransformError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl Transform for MockTransform {
    async fn transform(&self, resource: Resource) -> Result<Option<Resource>, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Severity;

    #[tokio::test]
    async fn store_rejects_stale_resource_version() {
        let store = MockStore::with_resources([Resource::new("ns", "a")]);
        let key = ObjectKey::new("ns", "a");
        let current = store.object(&key).unwrap();
        let updated = store.update(&current.clone().with_data("k", "v")).await.unwrap();
        assert_ne!(updated.resource_version, current.resource_version);

        let err = store.update(&current.with_data("k", "w")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {:?}", err);
        assert_eq!(store.updates(), 1);
    }

    #[tokio::test]
    async fn store_feed_relists_then_streams_updates() {
        let store = MockStore::with_resources([Resource::new("ns", "a")]);
        let (tx, mut rx) = mpsc::channel(8);
        let store = std::sync::Arc::new(store);
        let feed = std::sync::Arc::clone(&store);
        let task = tokio::spawn(async move { feed.run(tx).await });

        match rx.recv().await {
            Some(ChangeEvent::Restarted(list)) => assert_eq!(list.len(), 1),
            other => panic!("expected relist, got {:?}", other),
        }
        store.insert(Resource::new("ns", "b"));
        match rx.recv().await {
            Some(ChangeEvent::Applied(r)) => assert_eq!(r.name, "b"),
            other => panic!("expected applied, got {:?}", other),
        }
        drop(rx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn recorder_wait_for_returns_recorded_events() {
        let rec = MockRecorder::new();
        rec.record(Event::for_key(ObjectKey::new("ns", "a"), Severity::Warning, "r", "m"));
        let got = rec.wait_for(1, Duration::from_millis(50)).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].reason, "r");
    }
}
