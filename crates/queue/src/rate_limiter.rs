//! Requeue delay policies.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Decides how long a key waits before it is requeued.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; records the attempt.
    fn when(&self, key: &K) -> Duration;
    /// Drop any failure history for `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let n = failures.entry(key.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        // 2^64 already dwarfs any sane cap; keeps powi in range.
        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(64) as i32);
        if !backoff.is_finite() || backoff > self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys: `burst` immediate slots, then
/// `qps` per second. Each call reserves a slot.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: if qps > 0.0 { qps } else { DEFAULT_QPS },
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Combines limiters and answers with the longest delay.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K: Send + Sync> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        // Every member must see the attempt, so no short-circuit.
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters { l.forget(key); }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn controller_rate_limiter<K>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}

pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    controller_rate_limiter(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let rl = ItemExponentialFailureRateLimiter::<&str>::new(Duration::from_millis(5), Duration::from_millis(100));
        let got: Vec<_> = (0..8).map(|_| rl.when(&"k")).collect();
        assert_eq!(got[0], Duration::from_millis(5));
        assert_eq!(got[1], Duration::from_millis(10));
        assert_eq!(got[2], Duration::from_millis(20));
        assert_eq!(got[4], Duration::from_millis(80));
        assert_eq!(got[5], Duration::from_millis(100));
        assert_eq!(got[7], Duration::from_millis(100));
        assert!(got.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(rl.num_requeues(&"k"), 8);
    }

    #[test]
    fn exponential_backoff_is_per_key_and_forgettable() {
        let rl = ItemExponentialFailureRateLimiter::<&str>::new(Duration::from_millis(5), Duration::from_secs(1000));
        rl.when(&"a");
        rl.when(&"a");
        assert_eq!(rl.when(&"b"), Duration::from_millis(5));
        rl.forget(&"a");
        assert_eq!(rl.num_requeues(&"a"), 0);
        assert_eq!(rl.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_survives_huge_failure_counts() {
        let rl = ItemExponentialFailureRateLimiter::<u8>::new(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..200 { rl.when(&1); }
        assert_eq!(rl.when(&1), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_admits_burst_then_paces() {
        let rl = BucketRateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<u8>::when(&rl, &0), Duration::ZERO);
        }
        let d = RateLimiter::<u8>::when(&rl, &0);
        assert!(d > Duration::from_millis(90) && d <= Duration::from_millis(100), "d={:?}", d);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u8>::when(&rl, &0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_longest_and_forgets_all() {
        let rl = controller_rate_limiter::<&str>(Duration::from_millis(5), Duration::from_secs(1000), 1000.0, 1000);
        assert_eq!(rl.when(&"k"), Duration::from_millis(5));
        assert_eq!(rl.when(&"k"), Duration::from_millis(10));
        assert_eq!(rl.num_requeues(&"k"), 2);
        rl.forget(&"k");
        assert_eq!(rl.num_requeues(&"k"), 0);
        assert_eq!(rl.when(&"k"), Duration::from_millis(5));
    }
}
