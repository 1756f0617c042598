//! Retry with exponential backoff and jitter.
//!
//! Wraps calls to the database and to HTTP dependencies so that transient
//! failures (connection refused, timeouts, 429) do not surface to callers.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Decides whether a failed attempt is worth repeating.
pub trait Retryable {
    /// Returns true for transient failures (network errors, 429, 5xx); any
    /// other 4xx is final
    fn is_retryable(&self) -> bool;
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to randomize delays
    pub jitter: bool,
    /// Maximum jitter as a fraction of the computed delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Config for database round-trips: short, quick retries
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Set maximum attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    pub fn jitter(mut self, enable: bool) -> Self {
        self.jitter = enable;
        self
    }

    /// Set jitter factor
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must be greater than or equal to initial_delay".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay to wait after the zero-based `attempt` failed.
    ///
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`, then
    /// perturbed by up to `jitter_factor` in either direction when jitter is on.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter && self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

/// Retry strategy bound to one configuration
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        retry(operation, &self.config, |_, _, _| {}).await
    }

    /// Execute an operation with retry logic, calling `on_retry` before each wait
    pub async fn execute_with<F, Fut, T, E, H>(&self, operation: F, on_retry: H) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        H: FnMut(u32, &E, Duration),
    {
        retry(operation, &self.config, on_retry).await
    }
}

/// Re-invoke `operation` until it succeeds, fails with a non-retryable
/// error, or `max_attempts` is exhausted.
///
/// `on_retry(attempt, &error, delay)` runs before each wait, with `attempt`
/// counting from 1 for the attempt that just failed. The last error is
/// returned unchanged.
pub async fn retry<F, Fut, T, E, H>(
    mut operation: F,
    config: &RetryConfig,
    mut on_retry: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
    H: FnMut(u32, &E, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() {
                    debug!(error = %error, "Error not retryable");
                    return Err(error);
                }

                if attempt + 1 >= max_attempts {
                    debug!(attempts = max_attempts, "Maximum retry attempts reached");
                    return Err(error);
                }

                let delay = config.calculate_delay(attempt);
                warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    max_attempts,
                    delay,
                    error
                );
                on_retry(attempt + 1, &error, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct HttpStatus(u16);

    impl Display for HttpStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "HTTP {}", self.0)
        }
    }

    impl Retryable for HttpStatus {
        fn is_retryable(&self) -> bool {
            crate::error::is_retryable_status(self.0)
        }
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig::new()
            .initial_delay(Duration::from_millis(1000))
            .backoff_multiplier(2.0)
            .max_delay(Duration::from_millis(10_000))
            .jitter(false)
    }

    #[test]
    fn test_calculate_delay_exponential_and_clamped() {
        let config = no_jitter();
        let delays: Vec<u128> = (0..7).map(|a| config.calculate_delay(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000, 10_000]);
    }

    #[test]
    fn test_calculate_delay_with_jitter_stays_in_range() {
        let config = no_jitter().jitter(true).jitter_factor(0.1);
        for _ in 0..50 {
            let delay = config.calculate_delay(1).as_millis();
            assert!((1800..=2200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().max_attempts(0).validate().is_err());
        assert!(RetryConfig::default()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RetryConfig::default().backoff_multiplier(0.5).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connection_refused_then_succeeds() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let mut retries = Vec::new();

        let result = retry(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                } else {
                    Ok("ready")
                }
            },
            &no_jitter().max_attempts(3),
            |attempt, _err: &io::Error, delay| retries.push((attempt, delay)),
        )
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![(1, Duration::from_millis(1000)), (2, Duration::from_millis(2000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let mut hook_calls = 0;

        let result: Result<(), HttpStatus> = retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HttpStatus(404))
            },
            &no_jitter().max_attempts(5),
            |_, _, _| hook_calls += 1,
        )
        .await;

        assert_eq!(result.unwrap_err().0, 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hook_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_status_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), BackendError> = retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::status(408, "timeout"))
            },
            &no_jitter().max_attempts(3),
            |_, _, _| {},
        )
        .await;

        assert_eq!(result.unwrap_err(), BackendError::status(408, "timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried_and_last_error_returned() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::new(no_jitter().max_attempts(4));

        let result: Result<(), HttpStatus> = policy
            .execute(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(HttpStatus(if n < 3 { 429 } else { 503 }))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().0, 503);
    }
}
