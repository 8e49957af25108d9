// src/retry/strategy.rs

use crate::config::RetryConfig;
use hyper::StatusCode;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Run `f` until it succeeds or the attempt budget is spent. The closure
    /// receives the 1-based attempt number; the last error is returned on
    /// exhaustion.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f(attempt).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if attempt >= self.config.max_attempts {
                        warn!(
                            "Retry failed after {} attempts: {}",
                            attempt, error
                        );
                        return Err(error);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    debug!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, backoff
                    );

                    if !backoff.is_zero() {
                        sleep(backoff).await;
                    }
                }
            }
        }
    }

    /// Exponential backoff with up to 25% jitter.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base().as_millis() as u64;
        let max = self.config.backoff_max().as_millis() as u64;

        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(max);
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }

    /// Whether an upstream status should be treated as a failed attempt.
    pub fn is_retryable_status(status: StatusCode) -> RetryDecision {
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RetryDecision::Retry,
            s if s.is_server_error() => RetryDecision::Retry,
            _ => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let strategy = RetryStrategy::new(config(3));
        let counter = AtomicU32::new(0);

        let result = strategy.execute(|_| async {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                Err("Temporary failure")
            } else {
                Ok("Success")
            }
        }).await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_max_attempts() {
        let strategy = RetryStrategy::new(config(2));
        let counter = AtomicU32::new(0);

        let result: Result<(), String> = strategy.execute(|attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {attempt}")) }
        }).await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let strategy = RetryStrategy::new(config(5));

        let first = strategy.calculate_backoff(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(13));

        let third = strategy.calculate_backoff(3);
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));

        let tenth = strategy.calculate_backoff(10);
        assert!(tenth >= Duration::from_millis(100) && tenth <= Duration::from_millis(125));
    }

    #[test]
    fn zero_base_means_no_backoff() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        });
        assert!(strategy.calculate_backoff(3).is_zero());
    }

    #[test]
    fn retryable_statuses() {
        use RetryDecision::*;
        assert_eq!(RetryStrategy::is_retryable_status(StatusCode::BAD_GATEWAY), Retry);
        assert_eq!(RetryStrategy::is_retryable_status(StatusCode::TOO_MANY_REQUESTS), Retry);
        assert_eq!(RetryStrategy::is_retryable_status(StatusCode::NOT_FOUND), NoRetry);
        assert_eq!(RetryStrategy::is_retryable_status(StatusCode::OK), NoRetry);
    }
}
