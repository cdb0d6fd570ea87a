//! Combined recovery manager: retries wrap breaker-gated calls, with
//! optional per-error-group fallback handlers and named recovery
//! strategies for call sites that can degrade gracefully.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ClientError, ErrorGroup};
use crate::resilience::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::resilience::retry::{RetryConfig, RetryManager};

/// A fallback producing a substitute value for a failed operation.
pub type FallbackFn = Arc<dyn Fn(&ClientError) -> Option<Value> + Send + Sync>;

pub struct RecoveryManager {
    retry: RetryManager,
    breaker: Arc<CircuitBreaker>,
    handlers: Mutex<HashMap<ErrorGroup, FallbackFn>>,
    strategies: Mutex<HashMap<String, FallbackFn>>,
}

/// Observable status of the recovery manager.
#[derive(Debug, Clone)]
pub struct RecoveryStatus {
    pub max_attempts: u32,
    pub strategy: crate::resilience::retry::BackoffStrategy,
    pub breaker: BreakerSnapshot,
    pub registered_handlers: Vec<ErrorGroup>,
    pub registered_strategies: Vec<String>,
}

impl RecoveryManager {
    pub fn new(retry_config: RetryConfig, breaker_config: BreakerConfig) -> Self {
        RecoveryManager {
            retry: RetryManager::new(retry_config),
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            handlers: Mutex::new(HashMap::new()),
            strategies: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Register a fallback for a whole error group.
    pub fn register_handler(&self, group: ErrorGroup, handler: FallbackFn) {
        debug!(?group, "registered recovery handler");
        self.handlers.lock().unwrap().insert(group, handler);
    }

    /// Register a named recovery strategy selectable per call.
    pub fn register_strategy(&self, name: impl Into<String>, strategy: FallbackFn) {
        let name = name.into();
        debug!(strategy = %name, "registered recovery strategy");
        self.strategies.lock().unwrap().insert(name, strategy);
    }

    /// Run an operation with retry around a breaker-gated call.
    ///
    /// On final failure, a registered per-group handler and then the named
    /// strategy (if any) may supply a fallback value; otherwise the error
    /// propagates.
    pub async fn execute<F, Fut>(
        &self,
        operation: &str,
        strategy: Option<&str>,
        mut f: F,
    ) -> Result<Value, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ClientError>>,
    {
        let breaker = self.breaker.clone();
        let result = self
            .retry
            .run(operation, || {
                let breaker = breaker.clone();
                let fut = f();
                async move { breaker.call(operation, || fut).await }
            })
            .await;

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let Some(handler) = self.handlers.lock().unwrap().get(&err.group()).cloned() {
            if let Some(fallback) = handler(&err) {
                warn!(operation, error = %err, "recovered via group handler");
                return Ok(fallback);
            }
        }
        if let Some(name) = strategy {
            if let Some(strategy_fn) = self.strategies.lock().unwrap().get(name).cloned() {
                if let Some(fallback) = strategy_fn(&err) {
                    warn!(operation, strategy = name, "recovered via named strategy");
                    return Ok(fallback);
                }
            }
        }
        Err(err)
    }

    pub fn status(&self) -> RecoveryStatus {
        RecoveryStatus {
            max_attempts: self.retry.config().max_attempts,
            strategy: self.retry.config().strategy,
            breaker: self.breaker.snapshot(),
            registered_handlers: self.handlers.lock().unwrap().keys().copied().collect(),
            registered_strategies: self.strategies.lock().unwrap().keys().cloned().collect(),
        }
    }
}
