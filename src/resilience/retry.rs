//! Retry manager with pluggable backoff strategies.
//!
//! Delay rules:
//! - `Fixed`: `base_delay` for every attempt.
//! - `Linear`: `base_delay * n` for attempt n.
//! - `Exponential`: `base_delay * multiplier^(n-1)`.
//! - `Fibonacci`: `base_delay * F(n)`, F(1) = F(2) = 1.
//! - `JitteredExponential`: exponential scaled by U(0.5, 1.0), always,
//!   independent of the `jitter` flag.
//!
//! When `jitter` is enabled, every other strategy's delay is scaled by
//! U(0.9, 1.1). All delays cap at `max_delay`. Attempt 0 (the first try)
//! never waits.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::{ClientError, ErrorGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    JitteredExponential,
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub strategy: BackoffStrategy,
    /// Error groups eligible for retry; the error value may still veto.
    pub retryable_groups: HashSet<ErrorGroup>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            strategy: BackoffStrategy::Exponential,
            retryable_groups: HashSet::from([ErrorGroup::Transport]),
        }
    }
}

impl RetryConfig {
    pub fn validated(self) -> Result<Self, ClientError> {
        if self.max_attempts < 1 {
            return Err(ClientError::Config(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ClientError::Config(
                "retry max_delay must be >= base_delay".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        RetryManager { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the given attempt (0-based). Attempt 0 is immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.config.base_delay.as_secs_f64();
        let raw = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                base * self.config.multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::Fibonacci => base * fibonacci(attempt) as f64,
            BackoffStrategy::JitteredExponential => {
                let exp = base * self.config.multiplier.powi(attempt as i32 - 1);
                exp * rand::thread_rng().gen_range(0.5..1.0)
            }
        };
        let jittered = if self.config.jitter
            && self.config.strategy != BackoffStrategy::JitteredExponential
        {
            raw * rand::thread_rng().gen_range(0.9..1.1)
        } else {
            raw
        };
        Duration::from_secs_f64(jittered.min(self.config.max_delay.as_secs_f64()))
    }

    /// True iff the attempt budget allows another try, the error's group is
    /// configured retryable, and the error itself does not veto.
    pub fn should_retry(&self, error: &ClientError, attempt: u32) -> bool {
        if attempt + 1 >= self.config.max_attempts {
            return false;
        }
        if !self.config.retryable_groups.contains(&error.group()) {
            return false;
        }
        error.is_retryable()
    }

    /// Run an async operation under this retry policy.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !self.should_retry(&err, attempt) {
                        if attempt + 1 >= self.config.max_attempts {
                            warn!(operation, attempts = attempt + 1, error = %err, "retry budget exhausted");
                        }
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt + 1);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 2 { 1 } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager(strategy: BackoffStrategy, jitter: bool) -> RetryManager {
        RetryManager::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter,
            strategy,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn exponential_without_jitter_is_exact() {
        let m = manager(BackoffStrategy::Exponential, false);
        assert_eq!(m.delay_for(0), Duration::ZERO);
        assert_eq!(m.delay_for(1), Duration::from_secs(1));
        assert_eq!(m.delay_for(2), Duration::from_secs(2));
        assert_eq!(m.delay_for(3), Duration::from_secs(4));
        assert_eq!(m.delay_for(4), Duration::from_secs(8));
        // Capped at max_delay.
        assert_eq!(m.delay_for(6), Duration::from_secs(10));
    }

    #[test]
    fn fixed_and_linear_without_jitter() {
        let fixed = manager(BackoffStrategy::Fixed, false);
        assert_eq!(fixed.delay_for(1), Duration::from_secs(1));
        assert_eq!(fixed.delay_for(4), Duration::from_secs(1));
        let linear = manager(BackoffStrategy::Linear, false);
        assert_eq!(linear.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn fibonacci_delays_follow_the_sequence() {
        let m = manager(BackoffStrategy::Fibonacci, false);
        let expected = [1u64, 1, 2, 3, 5, 8];
        for (i, f) in expected.iter().enumerate() {
            let attempt = i as u32 + 1;
            let delay = m.delay_for(attempt);
            assert_eq!(delay, Duration::from_secs(*f), "attempt {}", attempt);
        }
    }

    #[test]
    fn jitter_bounds_are_respected() {
        let m = manager(BackoffStrategy::Exponential, true);
        for _ in 0..50 {
            let d = m.delay_for(2).as_secs_f64();
            assert!((1.8..=2.2).contains(&d), "jittered delay {} out of bounds", d);
        }
    }

    #[test]
    fn jittered_exponential_uses_half_to_full_range() {
        // The dedicated strategy scales by U(0.5, 1.0) even with jitter off.
        let m = manager(BackoffStrategy::JitteredExponential, false);
        for _ in 0..50 {
            let d = m.delay_for(3).as_secs_f64();
            assert!((2.0..=4.0).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn should_retry_honors_budget_group_and_veto() {
        let m = manager(BackoffStrategy::Fixed, false);
        let transport = ClientError::ConnectionLost("x".into());
        assert!(m.should_retry(&transport, 0));
        assert!(!m.should_retry(&transport, 4));
        // Group not configured retryable.
        let auth = ClientError::SignatureInvalid("x".into());
        assert!(!m.should_retry(&auth, 0));
        // Error veto: protocol mismatch is transport but not retryable.
        let mismatch = ClientError::ProtocolMismatch("x".into());
        assert!(!m.should_retry(&mismatch, 0));
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let m = RetryManager::new(RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryConfig::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = m
            .run("test_op", move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ClientError::ServerUnavailable("busy".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_on_non_retryable() {
        let m = manager(BackoffStrategy::Fixed, false);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<(), _> = m
            .run("test_op", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::PermissionDenied("no".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
