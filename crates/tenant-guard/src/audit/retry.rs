//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{GuardError, GuardResult};

/// Returned when every attempt failed.
#[derive(Debug)]
pub(crate) struct RetryExhausted {
    pub attempts: u32,
    pub last_error: GuardError,
}

/// Runs `attempt` until it succeeds or `max_retries` retries have failed.
///
/// The delay starts at `initial_delay`, grows by `backoff_multiplier` and is
/// capped at `max_delay`.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    retry_config: &RetryConfig,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GuardResult<T>>,
{
    let mut delay = retry_config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;

        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "Audit write succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempts > retry_config.max_retries {
                    return Err(RetryExhausted {
                        attempts,
                        last_error: e,
                    });
                }

                warn!(
                    operation,
                    attempt = attempts,
                    max_retries = retry_config.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Audit write failed, retrying"
                );

                sleep(delay).await;
                delay = std::cmp::min(
                    Duration::from_secs_f64(delay.as_secs_f64() * retry_config.backoff_multiplier),
                    retry_config.max_delay,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::BackendError;

    fn failure() -> GuardError {
        GuardError::Backend(BackendError::Unavailable {
            backend_name: "test".to_string(),
            message: "busy".to_string(),
        })
    }

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&config(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(failure()) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = retry_with_backoff(&config(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failure()) }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100ms + 200ms + 300ms (capped)
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }
}
