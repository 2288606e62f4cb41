//! Token bucket shared by every request of a session.

use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Client-side request budget.
///
/// Callers wait for a token rather than fail; the wait is bounded by the
/// caller (see `PolicyClient`).
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket.
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            capacity,
            refill_per_second: config.refill_per_second.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.refilled_at = now;
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.take().is_none()
    }

    /// Takes a token or reports how long until one is available.
    fn take(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return None;
        }
        if self.refill_per_second <= 0.0 {
            return Some(Duration::from_secs(3600));
        }
        let missing = 1.0 - bucket.tokens;
        Some(Duration::from_secs_f64(missing / self.refill_per_second))
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        while let Some(wait) = self.take() {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limiter empty");
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens.floor() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let limiter = RateLimiter::new(&RateLimitConfig::new(3, 2.0));
        assert_eq!(limiter.available(), 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(&RateLimitConfig::new(1, 4.0));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let limiter = RateLimiter::new(&RateLimitConfig::new(2, 10.0));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 2);
    }
}
