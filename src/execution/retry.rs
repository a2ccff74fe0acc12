//! Exponential backoff retry

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::common::errors::{EngineError, Result};
use crate::config::ExecutorConfig;

/// Jitter added on top of each delay, as a fraction of it
const JITTER_FRACTION: f64 = 0.1;

/// Retry schedule: `delay(n) = min(base * multiplier^n, max) + jitter`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Capped delay after the 0-based `attempt`, without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        // f64::min drops NaN, so overflow and NaN both land on the cap
        Duration::from_secs_f64(raw.min(max).max(0.0))
    }

    /// Delay actually slept after the 0-based `attempt`: the capped delay plus
    /// up to 10% uniform jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        delay + delay.mul_f64(jitter)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. Never returns an `Err`; failures come back as
    /// [`RetryOutcome::Failed`] carrying the last error.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(operation = operation_name, attempt, max_attempts, "Executing");

            match operation().await {
                Ok(value) => {
                    info!(operation = operation_name, attempt, "Operation succeeded");
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) if !error.is_retryable() => {
                    error!(operation = operation_name, attempt, error = %error, "Operation failed with non-retryable error");
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
                Err(error) if attempt < max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(error) => {
                    error!(operation = operation_name, attempts = attempt, error = %error, "Operation failed after all attempts");
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Outcome of [`RetryPolicy::run`]
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: EngineError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Failed { error, .. } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<u32>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(EngineError::transient("test", "connection reset"))
            } else {
                Ok(n)
            })
        }
    }

    #[test]
    fn test_delays_grow_until_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(500),
            ..policy()
        };
        let delays: Vec<Duration> = (0..6).map(|n| policy.base_delay_for(n)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(policy().base_delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_at_most_ten_percent() {
        let policy = policy();
        for _ in 0..200 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(220));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let outcome = policy().run("flaky", flaky(2, calls.clone())).await;

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_result().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 0.1s then 0.2s, each with up to 10% jitter
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300), "{:?}", waited);
        assert!(waited <= Duration::from_millis(330), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy().run("down", flaky(u32::MAX, calls.clone())).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            outcome.into_result(),
            Err(EngineError::VenueTransient { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = policy()
            .run("rejected", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(EngineError::rejected("test", "insufficient balance")))
            })
            .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
