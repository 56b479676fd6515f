use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

use crate::config::{RetrySettings, TimeoutSettings};
use crate::error::EngineError;

/// Failure of one attempt, classified by the operation itself.
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Transient; worth another attempt if budget remains.
    Retryable(EngineError),
    /// Never retried; short-circuits the remaining budget.
    Fatal(EngineError),
}

/// Terminal outcome after the retry budget is spent (or short-circuited).
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: EngineError,
    pub attempts: u32,
    /// True when a fatal classification ended the run early.
    pub fatal: bool,
}

/// Bounded retry with exponential backoff and a per-attempt timeout.
/// Factored out of the stage pipeline so it can be tested on its own.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    pub fn from_settings(retry: &RetrySettings, timeout: &TimeoutSettings) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay_ms: retry.retry_delay_ms,
            backoff_factor: retry.backoff_factor,
            max_delay_ms: retry.max_delay_ms,
            attempt_timeout_ms: timeout.per_item_ms,
        }
    }

    /// Delay before attempt `k` (1-based): `base * factor^(k-2)`, capped.
    /// Attempt 1 runs immediately.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_factor.powi(attempt as i32 - 2);
        let delay = (self.base_delay_ms as f64 * factor).round() as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op` up to `max_retries + 1` times. Each attempt is bounded by
    /// the per-attempt timeout; a timed-out attempt counts as retryable
    /// unless it is the final one.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<(T, u32), RetryFailure>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let total_attempts = self.max_retries + 1;
        let mut last_error =
            EngineError::InternalScheduling(format!("{}: no attempt executed", label));

        for attempt in 1..=total_attempts {
            let delay = self.delay_before_attempt(attempt);
            if !delay.is_zero() {
                debug!(
                    "Backing off {}ms before attempt {}/{} for {}",
                    delay.as_millis(),
                    attempt,
                    total_attempts,
                    label
                );
                tokio::time::sleep(delay).await;
            }

            let attempt_timeout = Duration::from_millis(self.attempt_timeout_ms);
            match tokio::time::timeout(attempt_timeout, op(attempt)).await {
                Ok(Ok(value)) => return Ok((value, attempt)),
                Ok(Err(AttemptError::Fatal(error))) => {
                    warn!(
                        "{} failed fatally on attempt {}/{}: {}",
                        label, attempt, total_attempts, error
                    );
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        fatal: true,
                    });
                }
                Ok(Err(AttemptError::Retryable(error))) => {
                    warn!(
                        "{} failed on attempt {}/{}: {}",
                        label, attempt, total_attempts, error
                    );
                    last_error = error;
                }
                Err(_) => {
                    let timeout_error = EngineError::ItemTimeout(format!(
                        "{}: attempt {} exceeded {}ms",
                        label, attempt, self.attempt_timeout_ms
                    ));
                    warn!("{}", timeout_error);
                    last_error = timeout_error;
                }
            }
        }

        Err(RetryFailure {
            error: last_error,
            attempts: total_attempts,
            fatal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 10,
            attempt_timeout_ms: 200,
        }
    }

    #[test]
    fn backoff_schedule_follows_formula() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 350,
            attempt_timeout_ms: 1_000,
        };
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_millis(200));
        // Capped at the configured maximum.
        assert_eq!(policy.delay_before_attempt(4), Duration::from_millis(350));
        assert_eq!(policy.delay_before_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn always_retryable_failure_spends_full_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = policy(3)
            .run("stage", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AttemptError::Retryable(EngineError::RetryableStage(
                        "transient".to_string(),
                    )))
                }
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert!(!failure.fatal);
        assert!(matches!(failure.error, EngineError::RetryableStage(_)));
    }

    #[tokio::test]
    async fn fatal_failure_short_circuits_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = policy(5)
            .run("stage", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AttemptError::Fatal(EngineError::FatalStage(
                        "auth failed".to_string(),
                    )))
                }
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(failure.fatal);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("stage", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AttemptError::Retryable(EngineError::RetryableStage(
                            "transient".to_string(),
                        )))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;
        let (value, attempts) = result.unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_on_final_attempt_is_item_timeout() {
        let slow = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 5,
            attempt_timeout_ms: 20,
        };
        let result: Result<((), u32), _> = slow
            .run("stage", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(matches!(failure.error, EngineError::ItemTimeout(_)));
    }

    #[tokio::test]
    async fn timeout_on_earlier_attempt_allows_recovery() {
        let slow = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 5,
            attempt_timeout_ms: 30,
        };
        let result = slow
            .run("stage", |attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok::<_, AttemptError>(attempt)
            })
            .await;
        let (value, attempts) = result.unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts, 2);
    }
}
