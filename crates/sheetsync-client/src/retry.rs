//! Bounded retry for row-store calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::api::StoreError;
use crate::constants::{RETRY_DELAY, RETRY_DELAY_CAP};

/// How many times a transient failure is retried, and how long to wait first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    /// Pause before the first retry; doubles for each one after.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Fail on the first error.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Pause before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(RETRY_DELAY_CAP)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, RETRY_DELAY)
    }
}

/// Run `op`, retrying transient failures as `policy` allows.
///
/// Returns the final result and how many attempts were made. Non-transient
/// failures (4xx, decode) return immediately.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> (Result<T, StoreError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempts),
            Err(e) if e.is_transient() && attempts <= policy.retries => {
                let delay = policy.delay_before(attempts);
                warn!(
                    what,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_once_then_surfaced() {
        let calls = Cell::new(0);
        let (result, attempts) = with_retries(RetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(StoreError::Network("offline".into())) }
        })
        .await;

        assert_eq!(attempts, 2);
        assert_eq!(calls.get(), 2);
        assert_eq!(result, Err(StoreError::Network("offline".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_before_next_attempt() {
        let started = Instant::now();
        let seen = RefCell::new(Vec::new());
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let (result, attempts) = with_retries(policy, "test", || {
            seen.borrow_mut().push(started.elapsed());
            async { Err::<(), _>(StoreError::rejected(503, "busy")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 4);
        assert_eq!(
            *seen.borrow(),
            [
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1500),
                Duration::from_millis(3500),
            ]
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before(10), RETRY_DELAY_CAP);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let (result, attempts) = with_retries(policy, "test", || async {
            Err::<(), _>(StoreError::rejected(404, "Row not found"))
        })
        .await;

        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient() {
        let calls = Cell::new(0);
        let (result, attempts) = with_retries(RetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n == 1 { Err(StoreError::Network("blip".into())) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 2);
    }
}
