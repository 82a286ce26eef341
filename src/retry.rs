use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SourceError;
use crate::rate_limiter::RateLimiter;

/// One retry policy shared by every source call.
///
/// Only throttling responses are retried; every other outcome is returned to
/// the caller on the first attempt so the resolver can fall through to the
/// next strategy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), honouring a server hint when it asks for longer.
    pub fn backoff(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let computed = self.base_delay.saturating_mul(1u32 << exp);
        let delay = match hint {
            Some(h) if h > computed => h,
            _ => computed,
        };
        delay.min(self.max_delay)
    }

    /// Runs `op`, taking a rate-limiter token before every attempt.
    pub async fn run<T, F, Fut>(
        &self,
        limiter: &RateLimiter,
        source: &str,
        mut op: F,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            limiter.acquire().await;
            match op().await {
                Err(SourceError::RateLimited { retry_after }) if attempt < self.max_attempts => {
                    let wait = self.backoff(attempt, retry_after);
                    warn!(
                        source,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "throttled by source; backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    debug!(source, attempt, error = %err, "source call failed");
                    return Err(err);
                }
                Ok(v) => return Ok(v),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_honours_hint() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.backoff(1, None), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, None), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, None), Duration::from_millis(400));
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttling_once_then_gives_up() {
        let limiter = RateLimiter::new(10, 10.0);
        let policy = RetryPolicy::new(2, Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy
            .run(&limiter, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::RateLimited { retry_after: None }) }
            })
            .await;
        assert!(matches!(res, Err(SourceError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_throttle() {
        let limiter = RateLimiter::new(10, 10.0);
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let res = policy
            .run(&limiter, "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SourceError::RateLimited {
                            retry_after: Some(Duration::from_secs(2)),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(7));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let limiter = RateLimiter::new(10, 10.0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = policy
            .run(&limiter, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::Unavailable("503".into())) }
            })
            .await;
        assert!(matches!(res, Err(SourceError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let res: Result<(), _> = policy
            .run(&limiter, "test", || async { Err(SourceError::NotFound) })
            .await;
        assert_eq!(res, Err(SourceError::NotFound));
    }
}
