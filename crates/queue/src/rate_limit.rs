//! Retry delay policies for the work queue.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use keel_core::ResourceKey;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Decides how long a key waits before its next attempt.
pub trait RateLimiter: Send + Sync {
    /// Delay for the next attempt of `key`; records one more failure.
    fn when(&self, key: &ResourceKey) -> Duration;
    /// Clear retry state for `key`.
    fn forget(&self, key: &ResourceKey);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &ResourceKey) -> u32;
}

/// Tuning for the default limiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts after which a failing key is dropped. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Overall requeue rate across all keys.
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            max_attempts: None,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimitConfig {
    /// Per-key exponential backoff combined with an overall token bucket.
    pub fn build(&self) -> MaxOfRateLimiter {
        MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(self.base_delay, self.max_delay)),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<ResourceKey, u32>>,
}

impl ExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        let factor = 1u128 << exp.min(64);
        let nanos = self.base.as_nanos().saturating_mul(factor);
        if nanos >= self.max.as_nanos() {
            return self.max;
        }
        u64::try_from(nanos).map(Duration::from_nanos).unwrap_or(self.max)
    }
}

impl RateLimiter for ExponentialFailureRateLimiter {
    fn when(&self, key: &ResourceKey) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&self, key: &ResourceKey) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys; bounds the overall retry rate.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: if qps > 0.0 { qps } else { f64::MAX },
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ResourceKey) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        // Reserve a token even if it is not available yet; the debt sets the wait.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &ResourceKey) {}

    fn num_requeues(&self, _key: &ResourceKey) -> u32 {
        0
    }
}

/// Longest delay of its members; requeue counts come from the most pessimistic member.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ResourceKey) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ResourceKey) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> ResourceKey {
        ResourceKey::namespaced("ns", n)
    }

    #[test]
    fn exponential_grows_to_ceiling_and_resets() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(100));
        let k = key("a");
        let delays: Vec<_> = (0..8).map(|_| rl.when(&k)).collect();
        assert_eq!(
            delays,
            vec![5, 10, 20, 40, 80, 100, 100, 100].into_iter().map(Duration::from_millis).collect::<Vec<_>>()
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(rl.num_requeues(&k), 8);

        rl.forget(&k);
        assert_eq!(rl.num_requeues(&k), 0);
        assert_eq!(rl.when(&k), Duration::from_millis(5));
    }

    #[test]
    fn exponential_tracks_keys_independently() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        rl.when(&key("a"));
        rl.when(&key("a"));
        assert_eq!(rl.when(&key("b")), Duration::from_millis(1));
        assert_eq!(rl.num_requeues(&key("a")), 2);
    }

    #[test]
    fn exponential_survives_huge_exponents() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let k = key("hot");
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            let d = rl.when(&k);
            assert!(d >= last);
            last = d;
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let rl = BucketRateLimiter::new(1.0, 2);
        let k = key("a");
        assert_eq!(rl.when(&k), Duration::ZERO);
        assert_eq!(rl.when(&k), Duration::ZERO);
        assert_eq!(rl.when(&k), Duration::from_secs(1));
        assert_eq!(rl.when(&k), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(rl.when(&k), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_picks_longest() {
        let rl = RateLimitConfig { base_delay: Duration::from_millis(5), ..Default::default() }.build();
        let k = key("a");
        assert_eq!(rl.when(&k), Duration::from_millis(5));
        assert_eq!(rl.when(&k), Duration::from_millis(10));
        assert_eq!(rl.num_requeues(&k), 2);
        rl.forget(&k);
        assert_eq!(rl.num_requeues(&k), 0);
    }
}
