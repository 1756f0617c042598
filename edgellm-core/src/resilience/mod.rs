//! Retry and circuit breaking for calls that leave the process.
//!
//! ```text
//!   caller ──► ResiliencePolicy
//!                 │
//!                 ├── retry (exponential backoff + jitter)
//!                 │      │
//!                 │      └──► CircuitBreaker ──► operation
//!                 │              CLOSED / OPEN / HALF_OPEN
//! ```
//!
//! The job store runs every database round-trip through a `database`
//! policy; the runtime wraps its HTTP client in its own policy.

mod circuit_breaker;
mod policy;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use policy::ResiliencePolicy;
pub use retry::{retry, RetryConfig, RetryPolicy, Retryable};
