//! Bounded exponential backoff for broker round trips.
//!
//! Produce requests, offset commits and the consumer's fetch loop all go
//! through a [`RetryPolicy`]. Only errors for which [`MqError::is_retryable`]
//! holds get another attempt: a dropped connection, an exhausted pool, a
//! timeout, a group rebalance. Anything else returns on the first failure.
//!
//! ```text
//! attempt 0 ──fail──▶ sleep 100ms ──▶ attempt 1 ──fail──▶ sleep 200ms ──▶ ...
//!                                                  (capped at max_backoff)
//! after max_retries failed retries: the last error surfaces
//! ```
//!
//! The producer resends the same request on every attempt, so with
//! idempotence enabled a retried batch is appended at most once.

use crate::error::MqError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how patiently, to retry.
///
/// `backoff(n) = min(initial_backoff * backoff_multiplier^n, max_backoff)`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(millis as u64)
    }

    /// [`RetryPolicy::backoff`] scaled by a random factor in `[0.75, 1.25]`.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        self.backoff(attempt).mul_f64(factor)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// retries.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, MqError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MqError>>,
{
    run(policy, false, operation).await
}

/// Like [`retry_with_backoff`], with jitter so clients recovering from the
/// same outage spread their retries.
pub async fn retry_with_jittered_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, MqError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MqError>>,
{
    run(policy, true, operation).await
}

async fn run<F, Fut, T>(policy: &RetryPolicy, jitter: bool, mut operation: F) -> Result<T, MqError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MqError>>,
{
    let mut retries = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(retries, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(code = err.code(), error = %err, "Not retryable");
            return Err(err);
        }
        if retries >= policy.max_retries {
            warn!(
                retries,
                code = err.code(),
                error = %err,
                "Giving up after retries"
            );
            return Err(err);
        }

        let delay = if jitter {
            policy.jittered_backoff(retries)
        } else {
            policy.backoff(retries)
        };
        warn!(
            retry = retries + 1,
            of = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            code = err.code(),
            error = %err,
            "Transient failure, retrying"
        );
        sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(8),
            backoff_multiplier: 2.0,
        }
    }

    /// Operation that fails with `errors` in order, then yields `"acked"`.
    fn scripted(
        errors: Vec<MqError>,
    ) -> (
        Arc<AtomicUsize>,
        impl FnMut() -> std::future::Ready<Result<&'static str, MqError>>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match errors.get(n) {
                Some(e) => Err(e.clone()),
                None => Ok("acked"),
            })
        };
        (calls, op)
    }

    fn broker_down() -> MqError {
        MqError::connection("produce", "broker down")
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let p = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
        };
        let delays: Vec<u64> = (0..6).map(|n| p.backoff(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(p.backoff(usize::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_flat_multiplier_keeps_delay() {
        let p = RetryPolicy {
            backoff_multiplier: 1.0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(0), p.backoff(7));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = RetryPolicy::default();
        for _ in 0..200 {
            let d = p.jittered_backoff(2);
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(500), "{:?}", d);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_absorbed() {
        let (calls, op) = scripted(vec![broker_down(), MqError::PoolExhausted { max: 4 }]);
        let result = retry_with_backoff(&policy(3), op).await;
        assert_eq!(result.unwrap(), "acked");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_last_error_surfaces_when_retries_run_out() {
        let (calls, op) = scripted(vec![broker_down(); 5]);
        let result = retry_with_jittered_backoff(&policy(2), op).await;
        assert!(matches!(result, Err(MqError::ConnectionFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (calls, op) = scripted(vec![
            MqError::timeout("commit", Duration::from_millis(5)),
            MqError::AuthenticationFailed("token expired".into()),
        ]);
        let result = retry_with_backoff(&policy(10), op).await;
        assert!(matches!(result, Err(MqError::AuthenticationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let (calls, op) = scripted(vec![broker_down()]);
        assert!(retry_with_backoff(&policy(0), op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let p = RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 3.0,
        };
        let (_, op) = scripted(vec![broker_down(); 3]);
        let started = tokio::time::Instant::now();
        let _ = retry_with_backoff(&p, op).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(450), "{:?}", elapsed);
    }
}
