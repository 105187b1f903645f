//! Retry with exponential backoff for transient failures.
//!
//! Every loop here is bounded twice: by an attempt ceiling and by a cap on
//! the total time spent sleeping between attempts.

use crate::error::Classify;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Upper bound for the sum of all delays.
    pub max_total_wait: Duration,
    /// Backoff multiplier between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_total_wait: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Sum of the backoff delays between `max_attempts` attempts when no
    /// server hints are given.
    pub fn schedule_wait(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_for(attempt, None))
            .sum()
    }

    /// A wait budget that never cuts retries short, even when every delay
    /// comes from a server hint capped at `max_delay`.
    pub fn full_budget(&self) -> Duration {
        let hinted = self.max_delay * self.max_attempts.saturating_sub(1);
        hinted.max(self.schedule_wait())
    }
}

/// Outcome of a retried operation along with how many attempts it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub total_wait: Duration,
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// budget runs out. `label` only feeds log lines.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;
    let mut total_wait = Duration::ZERO;

    loop {
        attempts += 1;
        match operation(attempts).await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(label, attempts, "Succeeded after retry");
                }
                return Retried {
                    result: Ok(value),
                    attempts,
                    total_wait,
                };
            }
            Err(error) => {
                let delay = policy.delay_for(attempts, error.retry_after());
                let exhausted = attempts >= max_attempts;
                let over_budget = total_wait + delay > policy.max_total_wait;

                if !error.is_transient() || exhausted || over_budget {
                    if error.is_transient() {
                        warn!(label, attempts, error = %error, "Giving up after retries");
                    }
                    return Retried {
                        result: Err(error),
                        attempts,
                        total_wait,
                    };
                }

                warn!(
                    label,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                total_wait += delay;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_total_wait: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(350));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn test_schedule_wait_and_full_budget() {
        let policy = RetryPolicy {
            max_attempts: 8,
            ..RetryPolicy::default()
        };
        // 0.5 + 1 + 2 + 4 + 8 + 10 + 10
        assert_eq!(policy.schedule_wait(), Duration::from_millis(35_500));
        assert_eq!(policy.full_budget(), Duration::from_secs(70));
        assert_eq!(RetryPolicy::once().schedule_wait(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_budget_reaches_high_ceiling() {
        let mut policy = RetryPolicy {
            max_attempts: 8,
            ..RetryPolicy::default()
        };
        policy.max_total_wait = policy.full_budget();
        let calls = AtomicU32::new(0);

        let outcome: Retried<(), SourceError> = with_retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::RateLimited { retry_after: None }) }
        })
        .await;

        assert_eq!(outcome.attempts, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(outcome.total_wait, Duration::from_millis(35_500));
    }

    #[tokio::test]
    async fn test_rate_limited_stops_at_ceiling() {
        let calls = AtomicU32::new(0);
        let outcome: Retried<(), SourceError> = with_retry(&fast_policy(4), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::RateLimited { retry_after: None }) }
        })
        .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(outcome.result, Err(SourceError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let outcome: Retried<(), SourceError> = with_retry(&fast_policy(5), "test", |_| async {
            Err(SourceError::AuthFailure("bad key".into()))
        })
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let outcome: Retried<&str, SourceError> =
            with_retry(&fast_policy(3), "test", |attempt| async move {
                if attempt < 2 {
                    Err(SourceError::Timeout)
                } else {
                    Ok("data")
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        tokio_test::assert_ok!(outcome.result);
    }

    #[tokio::test]
    async fn test_total_wait_budget_cuts_retries_short() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(4),
            max_delay: Duration::from_millis(4),
            max_total_wait: Duration::from_millis(10),
            multiplier: 1.0,
        };
        let outcome: Retried<(), SourceError> =
            with_retry(&policy, "test", |_| async { Err(SourceError::Timeout) }).await;

        // Two 4ms sleeps fit in the 10ms budget, a third would not.
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_wait, Duration::from_millis(8));
    }
}
