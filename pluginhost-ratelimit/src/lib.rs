//! Per-key token-bucket rate limiting with a background idle-bucket sweep.
//!
//! Keyed by whatever the caller derives identity from (runtime id, IP, a
//! configured extractor) — this crate only sees `&str` keys. Each bucket is
//! independent; there is no cross-key coordination, so multi-replica
//! deployments must divide rate budgets accordingly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Bucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Refill based on elapsed time, then try to take one token.
    ///
    /// Invalid configuration (negative rate or negative capacity) denies
    /// every request rather than panicking; a zero refill rate means no
    /// refill at all — the bucket only ever drains its initial burst.
    fn try_consume(&mut self) -> bool {
        if self.capacity < 0.0 || self.refill_per_sec < 0.0 {
            return false;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_idle(&self, threshold: Duration) -> bool {
        self.last_refill.elapsed() >= threshold
    }
}

/// A token-bucket rate limiter shared across every caller key in a process.
///
/// Construction starts a background sweeper task that removes buckets idle
/// longer than `idle_threshold`. Dropping the last [`RateLimiter`] handle
/// does not stop the sweeper — call [`RateLimiter::close`] for a clean,
/// idempotent shutdown.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
    cancel: CancellationToken,
}

impl RateLimiter {
    /// Build a limiter with the given per-key capacity/refill rate, and spawn
    /// its idle sweeper on the current tokio runtime.
    ///
    /// `sweep_interval` is how often the sweeper wakes; `idle_threshold` is
    /// how long a bucket may go unrefilled before it is evicted.
    pub fn new(capacity: f64, refill_per_sec: f64, sweep_interval: Duration, idle_threshold: Duration) -> Self {
        let buckets: Arc<DashMap<String, Bucket>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let sweep_buckets = buckets.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let before = sweep_buckets.len();
                        sweep_buckets.retain(|_, bucket| !bucket.is_idle(idle_threshold));
                        let evicted = before - sweep_buckets.len();
                        if evicted > 0 {
                            tracing::debug!(evicted, "rate limiter sweep evicted idle buckets");
                        }
                    }
                }
            }
        });

        RateLimiter {
            buckets,
            capacity,
            refill_per_sec,
            cancel,
        }
    }

    /// Try to take one token for `key`, creating its bucket on first use.
    pub fn allow(&self, key: &str) -> bool {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.capacity, self.refill_per_sec));
        entry.value_mut().try_consume()
    }

    /// Stop the background sweeper. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_within_capacity_then_denies() {
        let limiter = RateLimiter::new(2.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
        assert!(limiter.allow("caller"));
        assert!(limiter.allow("caller"));
        assert!(!limiter.allow("caller"));
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(1.0, 10.0, Duration::from_secs(60), Duration::from_secs(300));
        assert!(limiter.allow("caller"));
        assert!(!limiter.allow("caller"));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.allow("caller"));
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn negative_capacity_denies_every_request() {
        let limiter = RateLimiter::new(-1.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
        assert!(!limiter.allow("caller"));
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_rate_only_allows_initial_burst() {
        let limiter = RateLimiter::new(2.0, 0.0, Duration::from_secs(60), Duration::from_secs(300));
        assert!(limiter.allow("caller"));
        assert!(limiter.allow("caller"));
        assert!(!limiter.allow("caller"));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!limiter.allow("caller"));
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_buckets() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_millis(50), Duration::from_millis(100));
        limiter.allow("caller");
        assert_eq!(limiter.bucket_count(), 1);
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(limiter.bucket_count(), 0);
        limiter.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
        limiter.close();
        limiter.close();
    }
}
