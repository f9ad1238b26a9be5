//! Full-jitter exponential backoff and a cancellable retry driver.
//!
//! Delays are drawn uniformly from `[0, min(max, base * 2^(attempt - 1))]`.
//! Every wait observes the caller's `CancellationToken`; a canceled wait
//! surfaces as [`Canceled`], never as an exhausted retry budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Operation aborted by a cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Retry bounds shared by the retry driver and the provider client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_delay(
            attempt,
            self.base_backoff_ms,
            self.max_backoff_ms,
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Jittered delay in milliseconds for a 1-based attempt; `0` counts as `1`.
pub fn compute_delay(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let attempt = attempt.max(1);
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let cap = base_ms.saturating_mul(factor).min(max_ms);
    if cap == 0 {
        return 0;
    }
    rand::rng().random_range(0..=cap)
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Canceled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `operation` until it succeeds, the budget is spent, or `should_retry`
/// rejects the error. Used for plain request/response calls; streamed
/// generation keeps its own loop because it waits on server hints.
///
/// `operation` receives the 1-based attempt number and a clone of `cancel`.
/// `on_retry` is told `(attempt, error, delay)` before each wait.
pub async fn retry_with_backoff<T, E, Op, Fut, S, R>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut should_retry: S,
    mut on_retry: R,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut(u32, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Canceled>,
    S: FnMut(&E) -> bool,
    R: FnMut(u32, &E, Duration),
{
    if cancel.is_cancelled() {
        return Err(Canceled.into());
    }

    let mut attempt = 1u32;
    loop {
        let err = match operation(attempt, cancel.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt > policy.max_retries || !should_retry(&err) {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        on_retry(attempt, &err, delay);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying operation after backoff"
        );
        sleep_or_cancel(delay, cancel).await?;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Boom,
        Fatal,
        Canceled,
    }

    impl From<Canceled> for TestError {
        fn from(_: Canceled) -> Self {
            TestError::Canceled
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_compute_delay_stays_within_cap() {
        for _ in 0..200 {
            assert!(compute_delay(1, 100, 2_000) <= 100);
            assert!(compute_delay(3, 100, 2_000) <= 400);
            assert!(compute_delay(5, 100, 2_000) <= 1_600);
            assert!(compute_delay(9, 100, 2_000) <= 2_000);
        }
    }

    #[test]
    fn test_compute_delay_treats_zero_attempt_as_first() {
        for _ in 0..200 {
            assert!(compute_delay(0, 100, 2_000) <= 100);
        }
    }

    #[test]
    fn test_compute_delay_saturates_for_huge_attempts() {
        for attempt in [64, 65, 1_000, u32::MAX] {
            assert!(compute_delay(attempt, 250, 30_000) <= 30_000);
        }
        assert_eq!(compute_delay(4, 0, 1_000), 0);
        assert_eq!(compute_delay(4, 100, 0), 0);
    }

    #[tokio::test]
    async fn test_retry_invokes_initial_plus_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();
        let cancel = CancellationToken::new();

        let result: Result<(), TestError> = retry_with_backoff(
            fast_policy(2),
            &cancel,
            |_| true,
            |attempt, _, _| retries.push(attempt),
            |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Boom)
                }
            },
        )
        .await;

        assert_eq!(result, Err(TestError::Boom));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retry_stops_when_should_retry_rejects() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), TestError> = retry_with_backoff(
            fast_policy(5),
            &cancel,
            |err| *err != TestError::Fatal,
            |_, _, _| {},
            |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            },
        )
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let cancel = CancellationToken::new();
        let result: Result<u32, TestError> = retry_with_backoff(
            fast_policy(4),
            &cancel,
            |_| true,
            |_, _, _| {},
            |attempt, _| async move {
                if attempt < 3 {
                    Err(TestError::Boom)
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_precanceled_never_invokes_operation() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), TestError> = retry_with_backoff(
            fast_policy(3),
            &cancel,
            |_| true,
            |_, _, _| {},
            |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(result, Err(TestError::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_cancel_during_wait_fails_fast() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: 5,
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), TestError> = retry_with_backoff(
            policy,
            &cancel,
            |_| true,
            |_, _, _| {},
            |_, _| async { Err(TestError::Boom) },
        )
        .await;

        // A zero jitter draw can skip the wait entirely; the next attempt then
        // waits again, so the loop still ends in Canceled.
        assert_eq!(result, Err(TestError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
