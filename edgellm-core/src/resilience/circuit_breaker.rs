//! Circuit breaker pattern implementation for fault tolerance
//!
//! Guards a single downstream dependency (database, LLM runtime, vector
//! store, embedding service). Once the dependency has failed
//! `failure_threshold` times the breaker opens and every call fails fast with
//! [`CircuitOpenError`] until `timeout` has elapsed; the next call then runs
//! as a half-open trial.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CircuitOpenError;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests are allowed through
    Closed,
    /// Requests are rejected immediately
    Open,
    /// Trial requests are allowed through to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close the circuit
    pub success_threshold: u32,
    /// Time after the last failure before a trial call is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, timeout: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set recovery timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker for one protected resource
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
                timeout: config.timeout,
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Name of the protected resource
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get counters and state
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Execute an operation, counting only errors for which
    /// `counts_as_failure` returns true.
    ///
    /// Errors that are not counted still propagate but leave the breaker
    /// untouched.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        counts_as_failure: C,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> bool,
    {
        self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.record_failure();
                }
                Err(error)
            }
        }
    }

    /// Check whether a call may proceed, moving OPEN to HALF_OPEN once the
    /// timeout has elapsed.
    fn acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner.last_failure_time.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if elapsed >= self.config.timeout {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!("Circuit breaker for {} transitioned to HALF_OPEN", self.name);
            Ok(())
        } else {
            debug!(service = %self.name, "Circuit open, rejecting call");
            Err(CircuitOpenError::new(self.name.clone()))
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!("Circuit breaker for {} transitioned to CLOSED", self.name);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.failure_count,
                        "Circuit breaker for {} transitioned to OPEN", self.name
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!("Circuit breaker for {} reopened after half-open failure", self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to CLOSED with cleared counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
