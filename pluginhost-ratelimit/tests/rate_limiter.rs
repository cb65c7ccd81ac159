use pluginhost_ratelimit::RateLimiter;
use std::time::Duration;

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn allows_burst_up_to_capacity_then_blocks() {
    let limiter = RateLimiter::new(3.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
    assert!(limiter.allow("key"));
    assert!(limiter.allow("key"));
    assert!(limiter.allow("key"));
    assert!(!limiter.allow("key"));
    limiter.close();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn refills_after_waiting() {
    let limiter = RateLimiter::new(2.0, 20.0, Duration::from_secs(60), Duration::from_secs(300));
    assert!(limiter.allow("key"));
    assert!(limiter.allow("key"));
    assert!(!limiter.allow("key"));
    tokio::time::advance(Duration::from_millis(110)).await;
    assert!(limiter.allow("key"));
    limiter.close();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn independent_keys_do_not_share_buckets() {
    let limiter = RateLimiter::new(1.0, 1.0, Duration::from_secs(60), Duration::from_secs(300));
    assert!(limiter.allow("a"));
    assert!(!limiter.allow("a"));
    assert!(limiter.allow("b"));
    limiter.close();
}
