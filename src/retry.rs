//! Execute-with-policy wrapper shared by every outbound call.
//!
//! Transient failures (rate limits, 5xx, timeouts) are retried with capped
//! exponential backoff. Permanent failures (bad credentials, bad requests) are
//! never retried: they are operator-actionable and masking them would hide a
//! misconfiguration.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Implemented by every outbound-call error so the retry wrapper can decide
/// whether another attempt can possibly help.
pub trait Classify {
    fn class(&self) -> FailureClass;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        assert!(
            max_backoff_ms >= initial_backoff_ms,
            "max_backoff_ms must be >= initial_backoff_ms"
        );
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delay before the retry following failure number `failures` (1-based).
    /// Doubles per failure, capped, so the schedule never decreases.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `operation` under this policy. Permanent failures return
    /// immediately; transient failures are retried until `max_attempts` is
    /// reached, then the last error is returned.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.class() == FailureClass::Permanent => {
                    debug!(error = %err, "permanent failure, not retrying");
                    return Err(err);
                }
                Err(err) if attempt >= self.max_attempts => {
                    warn!(error = %err, attempts = attempt, "retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff_after(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but when transient retries are
    /// exhausted returns `fallback` instead of the error. The caller must
    /// treat that value as a degraded result, not a success. Permanent
    /// failures still propagate.
    pub async fn execute_or<F, Fut, T, E>(&self, fallback: T, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(err) if err.class() == FailureClass::Permanent => Err(err),
            Err(err) => {
                warn!(error = %err, "returning degraded default after exhausted retries");
                Ok(fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    enum FakeError {
        Transient,
        Permanent,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                FakeError::Transient => write!(f, "transient"),
                FakeError::Permanent => write!(f, "permanent"),
            }
        }
    }

    impl Classify for FakeError {
        fn class(&self) -> FailureClass {
            match self {
                FakeError::Transient => FailureClass::Transient,
                FakeError::Permanent => FailureClass::Permanent,
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 1, 4)
    }

    #[test]
    fn backoff_schedule_is_monotone_and_capped() {
        let policy = RetryPolicy::new(5, 100, 800);
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_after(5), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn success_is_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = fast_policy(3)
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FakeError>(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_then_success_records_two_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = fast_policy(3)
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(FakeError::Transient)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn always_transient_makes_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = fast_policy(4)
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Transient)
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_is_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = fast_policy(5)
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Permanent)
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_transient_yields_the_fallback() {
        let result = fast_policy(2)
            .execute_or("degraded", || async { Err::<&str, _>(FakeError::Transient) })
            .await;
        assert_eq!(result.unwrap(), "degraded");
    }

    #[tokio::test]
    async fn fallback_does_not_mask_permanent_failures() {
        let result = fast_policy(2)
            .execute_or("degraded", || async { Err::<&str, _>(FakeError::Permanent) })
            .await;
        assert!(result.is_err());
    }
}
