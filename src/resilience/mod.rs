//! Resilience Primitives
//!
//! Shared guards used by step handlers that reach unreliable dependencies.
//!
//! - [`retry`]: Exponential backoff with a pluggable retryable predicate
//! - [`breaker`]: Per-dependency circuit breakers
//! - [`guard`]: Fixed-window resource limits

pub mod breaker;
pub mod guard;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use guard::{GuardDecision, ResourceGuard, ResourceLimit, ResourceUsage};
pub use retry::{retry_with_backoff, ExhaustedAction, RetryPolicy, Sleeper, TokioSleeper};
