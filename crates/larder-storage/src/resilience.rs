//! Retry and timeout handling for adapter calls.
//!
//! Every adapter call made by the tier goes through a [`CallPolicy`]: the
//! call is bounded by a deadline, and transient failures are retried with
//! exponential backoff before the error is allowed to propagate.

use crate::adapter::Tier;
use crate::{Result, StorageError};
use std::future::Future;
use std::time::Duration;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_delay_ms * self.multiplier.powi(attempt as i32 - 1);
        let capped_delay =
            Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64);

        if self.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.25);
            Duration::from_millis((capped_delay.as_millis() as f64 * jitter_factor) as u64)
        } else {
            capped_delay
        }
    }

    /// Execute an operation, retrying transient storage errors.
    ///
    /// Errors for which [`StorageError::is_retryable`] is false are returned
    /// immediately.
    pub async fn execute<F, Fut, T>(&self, op: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            op,
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %e,
                            "Retry exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after delay"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Bounds a single adapter call by `timeout`.
pub async fn with_timeout<T, Fut>(tier: Tier, timeout: Duration, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::StoreTimeout { tier, timeout }),
    }
}

/// Deadline plus retry policy for one tier.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Tier reported in timeout errors.
    pub tier: Tier,
    /// Per-call deadline.
    pub timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl CallPolicy {
    /// Creates a policy for `tier`.
    #[must_use]
    pub fn new(tier: Tier, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            tier,
            timeout,
            retry,
        }
    }

    /// Runs `operation` with the deadline applied to each attempt.
    pub async fn call<F, Fut, T>(&self, op: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .execute(op, || with_timeout(self.tier, self.timeout, operation()))
            .await
    }

    /// Runs `operation` once, with the deadline but without retries.
    pub async fn call_once<Fut, T>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        with_timeout(self.tier, self.timeout, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let result = fast_policy(3)
            .execute("test", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::unavailable(Tier::Archive, "flaky"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_final_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = fast_policy(5)
            .execute("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Cancelled)
            })
            .await;

        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_maps_to_store_timeout() {
        let policy = CallPolicy::new(Tier::Primary, Duration::from_millis(10), fast_policy(2));
        let result: Result<()> = policy
            .call("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(StorageError::StoreTimeout {
                tier: Tier::Primary,
                ..
            })
        ));
    }
}
