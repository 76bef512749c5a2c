//! curlme work queue: deduplicating, rate-limited queue of keys with
//! per-key in-flight exclusion.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub mod rate_limiter;

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};

struct State<K> {
    /// Ready keys in FIFO order; each also sits in `dirty`.
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight).
    dirty: FxHashSet<K>,
    /// Keys currently held by a worker.
    processing: FxHashSet<K>,
    /// Delayed keys and the instant they become ready.
    waiting: FxHashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    /// Returns true when the key was pushed onto the ready queue.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_ready(&mut self, now: Instant) {
        if self.waiting.is_empty() {
            return;
        }
        let ready: Vec<K> = self.waiting.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
        for key in ready {
            self.waiting.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> { self.waiting.values().min().copied() }
}

/// Work queue shared by the change notifier (producer) and the workers.
///
/// A key handed out by [`get`](Self::get) stays in flight until
/// [`done`](Self::done); adds in the meantime are deferred, so no two workers
/// ever hold the same key.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        }
    }

    pub fn with_default_limiter() -> Self { Self::new(Box::new(default_controller_rate_limiter())) }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` unless it is already pending. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let pushed = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let pushed = st.insert(key);
            gauge!("workqueue_depth", st.queue.len() as f64);
            pushed
        };
        if pushed {
            counter!("workqueue_adds_total", 1u64);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed. If the key is already waiting,
    /// the earlier deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let at = Instant::now() + delay;
            st.waiting
                .entry(key)
                .and_modify(|cur| {
                    if at < *cur {
                        *cur = at;
                    }
                })
                .or_insert(at);
        }
        // A sleeping getter may need to shorten its deadline.
        self.notify.notify_one();
    }

    /// Requeue `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64);
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Wait for the next key and mark it in flight. Returns `None` once the
    /// queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                st.promote_ready(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    gauge!("workqueue_depth", st.queue.len() as f64);
                    drop(st);
                    if more {
                        // Pass the baton so idle getters pick up the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` finished. If it was re-added while in flight it goes back
    /// on the ready queue now.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(key);
            if st.dirty.contains(key) {
                st.queue.push_back(key.clone());
                gauge!("workqueue_depth", st.queue.len() as f64);
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting work. Blocked and future `get` calls drain what is
    /// already queued, then return `None`. Delayed keys are discarded.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.waiting.clear();
            debug!(queued = st.queue.len(), in_flight = st.processing.len(), "work queue shutting down");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready to be handed out (not counting delayed or in-flight ones).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )))
    }

    #[tokio::test]
    async fn rapid_adds_collapse_into_one_entry() {
        let q = queue();
        for _ in 0..10 {
            q.add("ns/a".to_string());
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_in_flight_is_deferred_until_done() {
        let q = queue();
        q.add("ns/a".to_string());
        let k = q.get().await.unwrap();
        q.add("ns/a".to_string());
        q.add("ns/a".to_string());
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");
        q.done(&k);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[test]
    fn only_fresh_keys_count_as_inserts() {
        let mut st: State<String> = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            shutting_down: false,
        };
        assert!(st.insert("a".to_string()));
        assert!(!st.insert("a".to_string()), "duplicate counted as an insert");
        st.queue.clear();
        st.processing.insert("b".to_string());
        assert!(!st.insert("b".to_string()), "in-flight key counted as an insert");
        assert!(st.dirty.contains("b"));
    }

    #[tokio::test]
    async fn done_on_readded_key_updates_depth() {
        let q = queue();
        q.add("ns/a".to_string());
        let k = q.get().await.unwrap();
        q.add("ns/a".to_string());
        assert_eq!(q.len(), 0);
        q.done(&k);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("ns/a".to_string());
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn fifo_order_across_keys() {
        let q = queue();
        for k in ["a", "b", "c"] {
            q.add(k.to_string());
        }
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_signals() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.shut_down();
        q.add("c".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await, None);
        assert_eq!(q.get().await, None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = queue();
        let t0 = Instant::now();
        q.add_after("a".to_string(), Duration::from_millis(100));
        assert!(q.is_empty());
        let early = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(early.is_err(), "delayed key surfaced early");
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert!(t0.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_earliest_deadline() {
        let q = queue();
        let t0 = Instant::now();
        q.add_after("a".to_string(), Duration::from_secs(10));
        q.add_after("a".to_string(), Duration::from_millis(20));
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(20) && waited < Duration::from_secs(10), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_backs_off_and_forget_resets() {
        let q = queue();
        let key = "ns/a".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(q.get().await, Some(key));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getter() {
        let q = std::sync::Arc::new(queue());
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("getter stuck").unwrap();
        assert_eq!(got, None);
    }
}
