//! Reconnect policy with quadratic backoff.
//!
//! This module provides the [`RetryPolicy`] type and the [`retry_with_backoff`]
//! driver used by [`Session::connect_with_retry`](crate::Session::connect_with_retry).
//! Brokers in orchestrated environments often boot after their clients, so a
//! single failed dial at startup is expected rather than fatal.
//!
//! # Retry Strategy
//!
//! - Only retries [`TransportError`]s that report
//!   [`is_retryable()`](TransportError::is_retryable); anything else fails on
//!   the spot
//! - The wait after the n-th consecutive failure (counting from 0) is
//!   `n² × backoff_unit`: 0s, 1s, 4s, 9s, … with the default unit
//! - Bounded by attempt count, not wall-clock time; wrap the caller in
//!   `tokio::time::timeout` for a hard deadline
//! - No sleep follows the final failed attempt

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::TransportError;

/// Default number of dial attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default backoff unit (one second).
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Bounded retry with quadratic backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,

    /// Scale of the backoff curve; the wait is `attempt² × backoff_unit`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // ---
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        // ---
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Wait applied after failure number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryExhausted {
    /// Attempts actually made.
    pub attempts: u32,
    /// Cause of the last failure.
    pub last_error: TransportError,
}

/// Retry an async operation with quadratic backoff.
///
/// `operation` receives the 1-based attempt number. `on_retry` is called
/// with the failed attempt number, the wait about to be applied and the
/// error, before the sleep begins.
///
/// # Returns
///
/// - `Ok(T)` if any attempt succeeds
/// - `Err(RetryExhausted)` after `max_attempts` retryable failures, or on
///   the first non-retryable failure
///
/// # Example
///
/// ```ignore
/// let conn = retry_with_backoff(&policy, |_, _, _| {}, |_| dialer.dial(uri, &opts)).await?;
/// ```
pub(crate) async fn retry_with_backoff<F, Fut, T, R>(
    policy: &RetryPolicy,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
    R: FnMut(u32, Duration, &TransportError),
{
    let mut failures: u32 = 0;

    loop {
        let attempt = failures + 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt >= policy.max_attempts => {
                tracing::debug!(attempt, error = %err, "retry abandoned");
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                let delay = policy.backoff(failures);
                on_retry(attempt, delay, &err);
                failures += 1;
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn unreachable() -> TransportError {
        TransportError::Unreachable("connection refused".into())
    }

    #[test]
    fn backoff_is_quadratic_from_zero() {
        // ---
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..5).map(|a| policy.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 4, 9, 16]);

        let fast = RetryPolicy::new(3).with_backoff_unit(Duration::from_millis(10));
        assert_eq!(fast.backoff(3), Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures_with_zero_then_one_second_waits() {
        // ---
        let policy = RetryPolicy::new(5);
        let waits = Arc::new(Mutex::new(Vec::new()));
        let waits_clone = waits.clone();
        let start = Instant::now();

        let result = retry_with_backoff(
            &policy,
            move |_, delay, _| waits_clone.lock().unwrap().push(delay),
            |attempt| async move {
                if attempt < 3 {
                    Err(unreachable())
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            *waits.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_secs(1)]
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_attempts() {
        // ---
        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = calls.clone();
        let start = Instant::now();

        let result: Result<(), _> = retry_with_backoff(
            &RetryPolicy::new(4),
            |_, _, _| {},
            move |_| {
                let calls = calls_clone.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(unreachable())
                }
            },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryExhausted {
                attempts: 4,
                last_error: unreachable()
            })
        );
        assert_eq!(*calls.lock().unwrap(), 4);
        // 0 + 1 + 4, nothing after the last attempt
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        // ---
        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = calls.clone();

        let result: Result<(), _> = retry_with_backoff(
            &RetryPolicy::new(5),
            |_, _, _| panic!("must not schedule a retry"),
            move |_| {
                let calls = calls_clone.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(TransportError::AccessRefused("bad password".into()))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn single_attempt_policy_never_sleeps() {
        // ---
        let result: Result<(), _> = retry_with_backoff(
            &RetryPolicy::new(1),
            |_, _, _| panic!("must not schedule a retry"),
            |_| async { Err(unreachable()) },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
    }
}
