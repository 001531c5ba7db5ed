use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Token bucket gating how fast new probes start. One token is added per
/// refill interval, up to `capacity`; the bucket starts full.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    capacity: u64,
    refill: Duration,
}

struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill: refill.max(Duration::from_nanos(1)),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Waits until `n` tokens are available and takes them. Requests above
    /// the capacity are clamped so they can still be served.
    pub async fn acquire(&self, n: u64) {
        let n = n.clamp(1, self.capacity);
        // Waiters queue on the mutex, so admission is first come first served.
        let mut bucket = self.bucket.lock().await;
        loop {
            self.refill(&mut bucket);
            if bucket.tokens >= n {
                bucket.tokens -= n;
                return;
            }
            let since = Instant::now().saturating_duration_since(bucket.last_refill);
            let wait = intervals(self.refill, n - bucket.tokens).saturating_sub(since);
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        if bucket.tokens >= self.capacity {
            bucket.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let count = u64::try_from(elapsed.as_nanos() / self.refill.as_nanos()).unwrap_or(u64::MAX);
        if count == 0 {
            return;
        }
        let added = count.min(self.capacity - bucket.tokens);
        bucket.tokens += added;
        if bucket.tokens >= self.capacity {
            bucket.last_refill = now;
        } else {
            // keep the partial interval already accrued
            bucket.last_refill += intervals(self.refill, count);
        }
    }
}

/// `count` refill intervals, saturating instead of truncating.
fn intervals(refill: Duration, count: u64) -> Duration {
    let nanos = refill.as_nanos().saturating_mul(u128::from(count));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_then_waits_for_refill() {
        let limiter = RateLimiter::new(3, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.acquire(1).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_matches_refill_interval() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..11 {
            limiter.acquire(1).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(120), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));
        limiter.acquire(2).await;
        sleep(Duration::from_secs(5)).await;
        let start = Instant::now();
        limiter.acquire(2).await;
        assert!(start.elapsed() < Duration::from_millis(1));
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_clamped() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));
        limiter.acquire(50).await;
        assert_eq!(limiter.capacity(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_with_huge_bucket_does_not_overcredit() {
        let capacity = 1u64 << 33;
        let limiter = RateLimiter::new(capacity, Duration::from_nanos(1));
        limiter.acquire(capacity).await;
        // more intervals than fit in a u32
        sleep(Duration::from_secs(5)).await;
        limiter.acquire(1).await;

        let start = Instant::now();
        limiter.acquire(capacity).await;
        assert!(start.elapsed() >= Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[test]
    fn interval_span_saturates() {
        assert_eq!(intervals(Duration::from_millis(2), 3), Duration::from_millis(6));
        assert_eq!(
            intervals(Duration::from_secs(1), 5_000_000_000),
            Duration::from_secs(5_000_000_000)
        );
        assert_eq!(
            intervals(Duration::from_secs(u64::MAX / 2), u64::MAX),
            Duration::from_nanos(u64::MAX)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shared_between_tasks() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire(1).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
