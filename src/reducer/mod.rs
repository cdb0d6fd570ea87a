//! Reducer dispatcher: correlated request/response over the connection,
//! with timeouts, bounded retry and cancellation.
//!
//! Every call gets a unique request id and a pending-table entry that
//! lives from transmit until response or timeout. Timed-out entries
//! linger for a grace period so a late response is logged and discarded
//! instead of being delivered to a new call. Server-reported failures
//! come back as tagged results; only the `_strict` variant raises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use sd_protocol::{
    error_codes, ClientMessage, Dialect, ReducerCall, ReducerCallStatus, ReducerResponse,
};

use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerStatus {
    Pending,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ReducerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReducerStatus::Pending => "pending",
            ReducerStatus::Success => "success",
            ReducerStatus::Failed => "failed",
            ReducerStatus::Timeout => "timeout",
            ReducerStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a reducer call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducerResult {
    pub request_id: String,
    pub reducer: String,
    pub status: ReducerStatus,
    pub payload: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ReducerResult {
    pub fn is_success(&self) -> bool {
        self.status == ReducerStatus::Success
    }

    pub fn error_text(&self) -> String {
        match (&self.error_code, &self.error_message) {
            (Some(code), Some(msg)) => format!("{}: {}", code, msg),
            (Some(code), None) => code.clone(),
            (None, Some(msg)) => msg.clone(),
            (None, None) => self.status.as_str().to_owned(),
        }
    }

    /// Convert a non-success result into the matching error variant.
    fn to_error(&self) -> ClientError {
        match self.status {
            ReducerStatus::Timeout => ClientError::Timeout(Duration::ZERO),
            ReducerStatus::Cancelled => ClientError::Cancelled(self.reducer.clone()),
            _ => match &self.error_code {
                Some(code) => ClientError::from_server_code(code, &self.error_text()),
                None => ClientError::GameState(self.error_text()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout: Duration,
    pub max_retries: u32,
    /// Base delay for the exponential retry backoff (doubles per attempt).
    pub retry_base: Duration,
    /// Cap on the retry backoff.
    pub retry_cap: Duration,
    /// How long a timed-out entry lingers so late responses are
    /// recognized and discarded.
    pub grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(10),
            grace: Duration::from_secs(5),
        }
    }
}

struct PendingEntry {
    reducer: String,
    deadline: Instant,
    status: ReducerStatus,
    tx: Option<oneshot::Sender<ReducerResponse>>,
}

#[derive(Debug, Default)]
struct DispatcherStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub retries: u64,
    pub pending: usize,
}

struct RdInner {
    connection: ConnectionManager,
    bus: EventBus,
    config: DispatcherConfig,
    dialect: Dialect,
    pending: Mutex<HashMap<String, PendingEntry>>,
    stats: DispatcherStats,
}

#[derive(Clone)]
pub struct ReducerDispatcher {
    inner: Arc<RdInner>,
}

impl ReducerDispatcher {
    pub fn new(
        connection: ConnectionManager,
        bus: EventBus,
        dialect: Dialect,
        config: DispatcherConfig,
    ) -> ReducerDispatcher {
        ReducerDispatcher {
            inner: Arc::new(RdInner {
                connection,
                bus,
                config,
                dialect,
                pending: Mutex::new(HashMap::new()),
                stats: DispatcherStats::default(),
            }),
        }
    }

    /// Invoke a reducer and return a tagged result. Server-reported
    /// failures do not raise; inspect the result.
    pub async fn call(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<ReducerResult, ClientError> {
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let args = format_args(self.inner.dialect, args);
        self.inner.stats.calls.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            let result = self.call_once(reducer, args.clone(), timeout).await?;
            let retryable = match result.status {
                ReducerStatus::Failed => result
                    .error_code
                    .as_deref()
                    .map(error_codes::is_retryable)
                    .unwrap_or(false),
                ReducerStatus::Timeout => true,
                _ => false,
            };
            if retryable && attempt < self.inner.config.max_retries {
                let delay = self.backoff(attempt);
                info!(
                    reducer,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying reducer call"
                );
                self.inner.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            self.record_outcome(&result);
            return Ok(result);
        }
    }

    /// Like [`call`](Self::call) but raises on any non-success outcome.
    pub async fn call_strict(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let result = self.call(reducer, args, timeout).await?;
        if result.is_success() {
            Ok(result.payload.clone().unwrap_or(Value::Null))
        } else {
            Err(result.to_error())
        }
    }

    /// Like [`call`](Self::call) but swallows every failure into `None`.
    pub async fn call_safe(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        match self.call(reducer, args, timeout).await {
            Ok(result) if result.is_success() => Some(result.payload.unwrap_or(Value::Null)),
            Ok(result) => {
                debug!(reducer, error = %result.error_text(), "reducer call failed");
                None
            }
            Err(e) => {
                debug!(reducer, error = %e, "reducer call errored");
                None
            }
        }
    }

    /// Cancel a pending call. The awaiting caller observes a Cancelled
    /// result; a late server response is suppressed.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut pending = self.inner.pending.lock().unwrap();
        match pending.get_mut(request_id) {
            Some(entry) if entry.status == ReducerStatus::Pending => {
                entry.status = ReducerStatus::Cancelled;
                entry.tx = None;
                self.inner.stats.cancellations.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Cancel every pending call (shutdown path).
    pub fn cancel_all(&self) {
        let mut pending = self.inner.pending.lock().unwrap();
        for entry in pending.values_mut() {
            if entry.status == ReducerStatus::Pending {
                entry.status = ReducerStatus::Cancelled;
                entry.tx = None;
            }
        }
    }

    /// Route an inbound `ReducerResponse` to its awaiting caller.
    pub fn handle_response(&self, response: ReducerResponse) {
        let mut pending = self.inner.pending.lock().unwrap();
        match pending.get_mut(&response.request_id) {
            Some(entry) => match entry.status {
                ReducerStatus::Pending => {
                    if let Some(tx) = entry.tx.take() {
                        let _ = tx.send(response);
                    }
                }
                ReducerStatus::Timeout => {
                    warn!(
                        request_id = %response.request_id,
                        reducer = %entry.reducer,
                        late_by_ms = entry.deadline.elapsed().as_millis() as u64,
                        "late response after timeout, discarding"
                    );
                    pending.remove(&response.request_id);
                }
                ReducerStatus::Cancelled => {
                    debug!(
                        request_id = %response.request_id,
                        "response for cancelled call, suppressing"
                    );
                    pending.remove(&response.request_id);
                }
                _ => {}
            },
            None => {
                warn!(request_id = %response.request_id, "response for unknown request");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Request ids currently in the pending table.
    pub fn pending_requests(&self) -> Vec<String> {
        self.inner.pending.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_pending(&self, request_id: &str) -> bool {
        self.inner.pending.lock().unwrap().contains_key(request_id)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            calls: self.inner.stats.calls.load(Ordering::Relaxed),
            successes: self.inner.stats.successes.load(Ordering::Relaxed),
            failures: self.inner.stats.failures.load(Ordering::Relaxed),
            timeouts: self.inner.stats.timeouts.load(Ordering::Relaxed),
            cancellations: self.inner.stats.cancellations.load(Ordering::Relaxed),
            retries: self.inner.stats.retries.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    // -- internal --

    async fn call_once(
        &self,
        reducer: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ReducerResult, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(
            request_id.clone(),
            PendingEntry {
                reducer: reducer.to_owned(),
                deadline: Instant::now() + timeout,
                status: ReducerStatus::Pending,
                tx: Some(tx),
            },
        );

        let msg = ClientMessage::ReducerCall(ReducerCall {
            request_id: request_id.clone(),
            reducer: reducer.to_owned(),
            args,
        });
        if let Err(e) = self.inner.connection.send(msg, Some(timeout)).await {
            self.inner.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Ok(result_from_response(reducer, response))
            }
            Ok(Err(_)) => {
                // Sender dropped: the call was cancelled.
                self.schedule_grace_cleanup(request_id.clone());
                Ok(ReducerResult {
                    request_id,
                    reducer: reducer.to_owned(),
                    status: ReducerStatus::Cancelled,
                    payload: None,
                    error_code: None,
                    error_message: Some("cancelled by caller".to_owned()),
                })
            }
            Err(_) => {
                if let Some(entry) = self.inner.pending.lock().unwrap().get_mut(&request_id) {
                    entry.status = ReducerStatus::Timeout;
                    entry.tx = None;
                }
                self.schedule_grace_cleanup(request_id.clone());
                Ok(ReducerResult {
                    request_id,
                    reducer: reducer.to_owned(),
                    status: ReducerStatus::Timeout,
                    payload: None,
                    error_code: None,
                    error_message: Some(format!("no response within {:?}", timeout)),
                })
            }
        }
    }

    fn schedule_grace_cleanup(&self, request_id: String) {
        let grace = self.inner.config.grace;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = inner.upgrade() {
                inner.pending.lock().unwrap().remove(&request_id);
            }
        });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .inner
            .config
            .retry_base
            .as_secs_f64()
            * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(exp.min(self.inner.config.retry_cap.as_secs_f64()))
    }

    fn record_outcome(&self, result: &ReducerResult) {
        let stats = &self.inner.stats;
        match result.status {
            ReducerStatus::Success => stats.successes.fetch_add(1, Ordering::Relaxed),
            ReducerStatus::Failed => stats.failures.fetch_add(1, Ordering::Relaxed),
            ReducerStatus::Timeout => stats.timeouts.fetch_add(1, Ordering::Relaxed),
            ReducerStatus::Cancelled => stats.cancellations.fetch_add(1, Ordering::Relaxed),
            ReducerStatus::Pending => 0,
        };
        self.inner.bus.publish(Event::reducer_completed(
            &result.reducer,
            &result.request_id,
            result.is_success(),
        ));
    }
}

fn result_from_response(reducer: &str, response: ReducerResponse) -> ReducerResult {
    let status = match response.status {
        ReducerCallStatus::Success => ReducerStatus::Success,
        ReducerCallStatus::Failed => ReducerStatus::Failed,
    };
    ReducerResult {
        request_id: response.request_id,
        reducer: reducer.to_owned(),
        status,
        payload: response.payload,
        error_code: response.error_code,
        error_message: response.error_message,
    }
}

/// Re-case top-level argument names for the target dialect, leaving
/// values untouched.
fn format_args(dialect: Dialect, args: Value) -> Value {
    match args {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (dialect.convert_field_name(&k), v))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_args_recases_per_dialect() {
        let args = json!({"player_id": 1, "direction": {"x": 1.0, "y": 0.0}});
        let c = format_args(Dialect::C, args.clone());
        assert!(c.get("PlayerId").is_some());
        assert_eq!(c["Direction"]["x"], 1.0);
        let d = format_args(Dialect::D, args.clone());
        assert!(d.get("playerID").is_some());
        let b = format_args(Dialect::B, args);
        assert!(b.get("player_id").is_some());
    }

    #[test]
    fn result_error_text_prefers_code_and_message() {
        let result = ReducerResult {
            request_id: "r".into(),
            reducer: "enter_game".into(),
            status: ReducerStatus::Failed,
            payload: None,
            error_code: Some("RATE_LIMITED".into()),
            error_message: Some("slow down".into()),
        };
        assert_eq!(result.error_text(), "RATE_LIMITED: slow down");
        assert!(!result.is_success());
    }

    #[test]
    fn strict_error_mapping() {
        let timeout = ReducerResult {
            request_id: "r".into(),
            reducer: "x".into(),
            status: ReducerStatus::Timeout,
            payload: None,
            error_code: None,
            error_message: None,
        };
        assert!(matches!(timeout.to_error(), ClientError::Timeout(_)));
        let denied = ReducerResult {
            request_id: "r".into(),
            reducer: "x".into(),
            status: ReducerStatus::Failed,
            payload: None,
            error_code: Some("PERMISSION_DENIED".into()),
            error_message: Some("not yours".into()),
        };
        assert!(matches!(denied.to_error(), ClientError::PermissionDenied(_)));
    }
}
