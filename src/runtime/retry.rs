//! Composable retry wrapper for backend calls.
//!
//! The policy is a plain value; the wrapper takes any retryable primitive
//! returning `RuntimeError` and re-attempts only when the error says it may.
//! After the last backoff the original error propagates unchanged.

use crate::errors::RuntimeError;
use std::time::Duration;

/// Exponential backoff policy: `initial * multiplier^n`, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(secs).min(self.max_backoff)
    }

    /// The full wait schedule, one entry per allowed retry.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|n| self.delay_for(n)).collect()
    }
}

/// Run `op` up to `1 + max_retries` times. `op` receives the attempt number
/// (0-based). Non-retryable errors propagate immediately; the final
/// retryable error propagates after the last backoff.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RuntimeError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, RuntimeError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "retryable backend error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(8),
            multiplier: 2.0,
        }
    }

    fn retryable_exit(code: i32) -> RuntimeError {
        RuntimeError::BackendExit {
            exit_code: code,
            retryable: true,
            stderr: String::new(),
        }
    }

    #[test]
    fn test_schedule_follows_multiplier_and_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            multiplier: 2.0,
        };
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );

        let capped = RetryPolicy {
            max_backoff: Duration::from_secs(8),
            ..policy
        };
        assert_eq!(capped.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let out = retry_with_policy(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RuntimeError>(7) }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = retry_with_policy(&policy(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(retryable_exit(72))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_original_error() {
        // 1 initial + 3 retries = 4 invocations, then the original code
        let calls = AtomicU32::new(0);
        let err = retry_with_policy(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(retryable_exit(5)) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_policy(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(RuntimeError::BackendExit {
                    exit_code: 1,
                    retryable: false,
                    stderr: "bad flag".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.is_retryable());
    }
}
