//! Retry and circuit breaker composed around one dependency.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::retry::{retry, RetryConfig, Retryable};
use crate::error::CircuitOpenError;

/// Retry on the outside, circuit breaker on the inside.
///
/// Each attempt passes through the breaker, so an open circuit fails the
/// current attempt with [`CircuitOpenError`]. Error types report that as
/// non-retryable, which ends the retry loop immediately.
#[derive(Debug)]
pub struct ResiliencePolicy {
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    pub fn new(
        name: impl Into<String>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self { retry, breaker: CircuitBreaker::new(name, breaker) }
    }

    /// Policy for database round-trips
    pub fn database() -> Self {
        Self::new("database", RetryConfig::database(), CircuitBreakerConfig::default())
    }

    /// Policy for an HTTP dependency
    pub fn http(name: impl Into<String>) -> Self {
        Self::new(name, RetryConfig::default(), CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `operation` with retries, every error counting against the breaker
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display + From<CircuitOpenError>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Run `operation` with retries, counting only errors selected by
    /// `counts_as_failure` against the breaker
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        counts_as_failure: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display + From<CircuitOpenError>,
        C: Fn(&E) -> bool,
    {
        let counts_as_failure = &counts_as_failure;
        let name = self.breaker.name();

        retry(
            || {
                // Futures are lazy: the operation does not run unless the
                // breaker admits the call.
                let attempt = operation();
                self.breaker.execute_classified(move || attempt, counts_as_failure)
            },
            &self.retry,
            |attempt, error: &E, delay: Duration| {
                debug!(service = %name, attempt, ?delay, error = %error, "Retrying call");
            },
        )
        .await
    }
}
