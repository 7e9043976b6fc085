//! Resilience wrapper for outbound calls
//!
//! - [`backoff`]: pure exponential backoff with jitter
//! - [`breaker`]: per-endpoint circuit breaker over a pluggable state table
//! - [`retry`]: bounded retries with per-attempt timeouts behind the breaker

pub mod backoff;
pub mod breaker;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use breaker::{
    Admission, BreakerSettings, BreakerStore, CallOutcome, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState, InMemoryBreakerStore,
};
pub use retry::{AttemptFailure, Classify, FailureKind, ResilienceError, RetryPolicy};
