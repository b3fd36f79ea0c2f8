//! Retry with exponential backoff and jitter.
//!
//! Generalizes `event_bus::consumer_retry::retry_with_backoff` with a
//! retry-predicate (so `NotFound` can be excluded) and jitter, as required by the
//! catalog client's retry policy.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * jitter;
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

/// Retry `operation` while `should_retry(&err)` is true, up to `config.max_attempts`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    should_retry: impl Fn(&E) -> bool,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) || attempt >= config.max_attempts {
                    warn!(
                        context,
                        attempts = attempt,
                        error = %e,
                        "operation failed, not retrying further"
                    );
                    return Err(e);
                }

                let delay = jittered(backoff, config.jitter);
                warn!(
                    context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = delay.as_millis(),
                    error = %e,
                    "operation failed, retrying with backoff"
                );
                sleep(delay).await;
                backoff = backoff.mul_f64(config.multiplier);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let config = RetryConfig::default();
        let result = retry_with_backoff(
            || async { Ok::<_, String>(42) },
            &config,
            |_: &String| true,
            "test",
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn retries_retryable_errors_then_succeeds() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            },
            &config,
            |_: &String| true,
            "test",
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn never_retries_non_retryable_errors() {
        let config = RetryConfig::default();
        let attempts = AtomicU32::new(0);
        let result: Result<i32, String> = retry_with_backoff(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("not found".to_string())
            },
            &config,
            |_: &String| false,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
