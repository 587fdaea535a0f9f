//! Retry policies for coordination operations.
//!
//! Every client-visible call gets exactly one session window to complete. Inside
//! that window transient failures (connection loss, fail-over to another ensemble
//! member) are retried with jittered exponential backoff; once the window closes the
//! call fails with [`CoordinationError::TimedOut`]. There are no unbounded loops.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Use Case |
//! |--------|-----------|-----------|----------|
//! | `session_policy` | 20ms | min(1s, window/4) | Client operations and the initial connect |
//!
//! Attempt counts are unbounded; the deadline passed to [`within_session_window`]
//! is what stops the loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use zkdiscovery::coordination::retry;
//!
//! let children = retry::within_session_window("get_children", window, |deadline| {
//!     let client = client.clone();
//!     async move { client.try_get_children("/zk", deadline).await }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::time::Instant;

use super::error::{CoordinationError, CoordinationResult};
use crate::constants::{RETRY_MAX_DELAY_MS, RETRY_MIN_DELAY_MS};
use crate::metrics;

fn max_delay_for(window: Duration) -> Duration {
    let cap = Duration::from_millis(RETRY_MAX_DELAY_MS);
    let quarter = window / 4;
    let min = Duration::from_millis(RETRY_MIN_DELAY_MS);
    quarter.clamp(min, cap)
}

/// Policy for client operations retried inside one session window.
///
/// Characteristics:
/// - Short initial delay (20ms) so a quick fail-over is barely noticeable
/// - Max delay capped at a quarter of the window, so the last attempt lands close
///   to the deadline instead of sleeping past it
/// - Includes jitter to avoid many clients reconnecting in lockstep
pub fn session_policy(window: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(RETRY_MIN_DELAY_MS))
        .with_max_delay(max_delay_for(window))
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Run `operation` until it succeeds, fails non-transiently, or the window closes.
///
/// `operation` receives the absolute deadline so it can bound its own waits
/// (for example, waiting for a suspended session to reconnect).
///
/// A transient error still present when the window closes is reported as
/// [`CoordinationError::TimedOut`].
pub async fn within_session_window<F, Fut, T>(
    op: &'static str,
    window: Duration,
    mut operation: F,
) -> CoordinationResult<T>
where
    F: FnMut(Instant) -> Fut,
    Fut: Future<Output = CoordinationResult<T>>,
{
    let deadline = Instant::now() + window;
    let mut attempts: u32 = 0;

    let result = (|| operation(deadline))
        .retry(session_policy(window))
        .when(|e: &CoordinationError| e.is_retriable() && Instant::now() < deadline)
        .notify(|e: &CoordinationError, delay: Duration| {
            attempts += 1;
            record_retry_attempt(op, attempts);
            tracing::debug!(op, error = %e, delay_ms = delay.as_millis() as u64, "Retrying coordination operation");
        })
        .await;

    match result {
        Ok(value) => {
            if attempts > 0 {
                record_retry_success(op);
            }
            Ok(value)
        }
        Err(e) if e.is_retriable() => {
            record_retry_exhausted(op);
            Err(CoordinationError::TimedOut {
                op,
                timeout: window,
            })
        }
        Err(e) => Err(e),
    }
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::trace!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (window closed while still failing).
pub fn record_retry_exhausted(policy_name: &str) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry window exhausted");
}

/// Record a success that needed at least one retry.
pub fn record_retry_success(policy_name: &str) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_max_delay_is_clamped() {
        assert_eq!(
            max_delay_for(Duration::from_secs(30)),
            Duration::from_millis(RETRY_MAX_DELAY_MS)
        );
        assert_eq!(
            max_delay_for(Duration::from_millis(400)),
            Duration::from_millis(100)
        );
        assert_eq!(
            max_delay_for(Duration::from_millis(10)),
            Duration::from_millis(RETRY_MIN_DELAY_MS)
        );
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let attempts = AtomicU32::new(0);

        let result = within_session_window("test_op", Duration::from_secs(5), |_| {
            let attempts = &attempts;
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordinationError::ConnectionLoss)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: CoordinationResult<()> =
            within_session_window("test_op", Duration::from_secs(5), |_| {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CoordinationError::NoNode("/missing".to_string()))
                }
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            CoordinationError::NoNode("/missing".to_string())
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_window_exhaustion_reports_timed_out() {
        let started = Instant::now();
        let result: CoordinationResult<()> =
            within_session_window("test_op", Duration::from_millis(200), |_| async {
                Err(CoordinationError::ConnectionLoss)
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timed_out(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_session_expired_surfaces_immediately() {
        let attempts = AtomicU32::new(0);
        let result: CoordinationResult<()> =
            within_session_window("test_op", Duration::from_secs(5), |_| {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CoordinationError::SessionExpired)
                }
            })
            .await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_receives_deadline() {
        let window = Duration::from_secs(3);
        let before = Instant::now();
        let seen = within_session_window("test_op", window, |deadline| async move {
            Ok::<_, CoordinationError>(deadline)
        })
        .await
        .unwrap();
        assert!(seen >= before + window);
        assert!(seen <= Instant::now() + window);
    }
}
