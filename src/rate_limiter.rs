use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

// Float rounding can leave the bucket a hair short of a whole token.
const MIN_WAIT: Duration = Duration::from_micros(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every worker.
///
/// Tokens accrue continuously at `refill_rate` per second up to `capacity`.
/// The lock is held only while the bucket is updated; waiting happens with the
/// lock released, so workers serialize on the bookkeeping and not on the sleep.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    inner: Mutex<Bucket>,
}

impl RateLimiter {
    /// A bucket that starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            inner: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Suspends until one token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.inner.lock().await;
                self.refill(&mut guard);

                if guard.tokens >= 1.0 {
                    guard.tokens -= 1.0;
                    return;
                }
                let missing = 1.0 - guard.tokens;
                Duration::from_secs_f64(missing / self.refill_rate).max(MIN_WAIT)
            };
            trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new(3, 2.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(499), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_refills_only_to_capacity() {
        let limiter = RateLimiter::new(1, 1.0);
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_bounded_under_many_workers() {
        let capacity = 5u32;
        let rate = 10.0;
        let limiter = Arc::new(RateLimiter::new(capacity, rate));
        let grants: Arc<AsyncMutex<Vec<Instant>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let limiter = limiter.clone();
            let grants = grants.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    limiter.acquire().await;
                    grants.lock().await.push(Instant::now());
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let grants = grants.lock().await;
        assert_eq!(grants.len(), 128);
        // Every window [t, t + period] holds at most capacity + rate * period grants.
        let period = Duration::from_secs(1);
        let bound = f64::from(capacity) + rate * period.as_secs_f64();
        let mut sorted = grants.clone();
        sorted.sort();
        for (i, t0) in sorted.iter().enumerate() {
            let in_window = sorted[i..]
                .iter()
                .take_while(|t| t.duration_since(*t0) <= period)
                .count();
            assert!(
                in_window as f64 <= bound + 1e-9,
                "window starting {:?} had {in_window} grants",
                t0.duration_since(start)
            );
        }
        // 128 grants, 5 up front, the rest at 10/s.
        assert!(start.elapsed() >= Duration::from_millis(12_250));
    }
}
