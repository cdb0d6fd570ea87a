//! Resilience primitives: retry manager, circuit breaker, and the
//! combined recovery manager that composes the two.

pub mod breaker;
pub mod recovery;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use recovery::{RecoveryManager, RecoveryStatus};
pub use retry::{BackoffStrategy, RetryConfig, RetryManager};
