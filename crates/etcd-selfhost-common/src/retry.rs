//! Retry utilities with exponential backoff and jitter.
//!
//! Every call that crosses the network (etcd gateway, Kubernetes API) goes
//! through here. The budget is bounded twice: by attempt count and by an
//! optional wall-clock budget measured from the first attempt. A budget of
//! zero attempts with no time budget retries forever, which callers only use
//! when an outer deadline bounds them.
//!
//! # Example
//!
//! ```ignore
//! use etcd_selfhost_common::retry::{retry_if, RetryConfig};
//!
//! let members = retry_if(
//!     &RetryConfig::with_max_attempts(5),
//!     "list_members",
//!     |e: &Error| e.is_retryable(),
//!     || async { etcd.list_members(&endpoints).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = bounded only by `max_elapsed`)
    pub max_attempts: u32,
    /// Wall-clock budget measured from the first attempt
    pub max_elapsed: Option<Duration>,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            max_elapsed: None,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config bounded by a wall-clock budget
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            max_elapsed: Some(budget),
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Set the initial and maximum backoff delays
    pub fn delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    fn exhausted(&self, attempt: u32, started: Instant, next_delay: Duration) -> bool {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return true;
        }
        match self.max_elapsed {
            Some(budget) => started.elapsed() + next_delay > budget,
            None => false,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until the config's budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Execute an async operation with backoff, retrying only errors accepted
/// by `should_retry`.
///
/// Errors rejected by the predicate are returned immediately, so permanent
/// failures (quorum, validation) surface without waiting out the budget.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                if config.exhausted(attempt, started, jittered_delay) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after exhausting retry budget"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            max_elapsed: None,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_if(
            &fast(10),
            "op",
            |e: &&str| *e != "permanent",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            },
        )
        .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_bounds_infinite_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig::with_budget(Duration::from_secs(10))
            .delays(Duration::from_secs(1), Duration::from_secs(4));

        let started = Instant::now();
        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down")
            }
        })
        .await;

        assert_eq!(result, Err("down"));
        assert!(started.elapsed() <= Duration::from_secs(10));
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
