//! Bearer tokens and the per-identity token manager.
//!
//! The manager stores one token per identity id and, when auto-refresh is
//! on, schedules a background refresh at `expires_at − refresh_buffer`
//! (default 300 s). There is at most one refresh task per identity:
//! storing a newer token replaces (and cancels) the previous schedule. A
//! failed refresh drops the token and fires the expiry callback, pushing
//! the state machine back to no-token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sd_protocol::TokenGrant;

use crate::error::ClientError;

/// Default lead time before expiry at which a refresh fires.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Opaque bearer value.
    pub token: String,
    /// Scheme tag, e.g. "Bearer".
    pub token_type: String,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds; `None` means the token does not expire.
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub identity_id: String,
}

impl AuthToken {
    pub fn new(
        token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: Option<i64>,
        identity_id: impl Into<String>,
    ) -> AuthToken {
        AuthToken {
            token: token.into(),
            token_type: token_type.into(),
            issued_at: now_secs(),
            expires_at,
            refresh_token: None,
            scope: None,
            identity_id: identity_id.into(),
        }
    }

    pub fn from_grant(grant: &TokenGrant, identity_id: &str) -> AuthToken {
        let issued_at = now_secs();
        AuthToken {
            token: grant.access_token.clone(),
            token_type: grant.token_type.clone(),
            issued_at,
            expires_at: Some(issued_at + grant.expires_in_secs as i64),
            refresh_token: grant.refresh_token.clone(),
            scope: grant.scope.clone(),
            identity_id: identity_id.to_owned(),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_secs() >= expires_at,
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && !self.is_expired()
    }

    pub fn expires_in_secs(&self) -> Option<i64> {
        self.expires_at.map(|e| (e - now_secs()).max(0))
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Exchanges an existing token (via its refresh credential) for a new one.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, token: AuthToken) -> BoxFuture<'static, Result<AuthToken, ClientError>>;
}

pub type RefreshedCallback = Arc<dyn Fn(&AuthToken) + Send + Sync>;
pub type ExpiredCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct TmInner {
    auto_refresh: bool,
    refresh_buffer: Duration,
    tokens: Mutex<HashMap<String, AuthToken>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    refresher: Mutex<Option<Arc<dyn TokenRefresher>>>,
    refreshed_callbacks: Mutex<HashMap<String, RefreshedCallback>>,
    expired_callbacks: Mutex<HashMap<String, ExpiredCallback>>,
}

/// Per-identity token storage with proactive refresh.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TmInner>,
}

/// Summary of one stored token for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSummary {
    pub identity_id: String,
    pub token_type: String,
    pub expires_in_secs: Option<i64>,
    pub is_valid: bool,
    pub has_refresh_token: bool,
}

impl TokenManager {
    pub fn new(auto_refresh: bool, refresh_buffer: Duration) -> TokenManager {
        TokenManager {
            inner: Arc::new(TmInner {
                auto_refresh,
                refresh_buffer,
                tokens: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                refresher: Mutex::new(None),
                refreshed_callbacks: Mutex::new(HashMap::new()),
                expired_callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_defaults() -> TokenManager {
        Self::new(true, DEFAULT_REFRESH_BUFFER)
    }

    pub fn set_refresher(&self, refresher: Arc<dyn TokenRefresher>) {
        *self.inner.refresher.lock().unwrap() = Some(refresher);
    }

    /// Store a token and (re)schedule its refresh. An existing schedule
    /// for the same identity is cancelled first, so refresh fires at most
    /// once per stored token.
    pub fn store_token(&self, token: AuthToken) {
        let identity_id = token.identity_id.clone();
        info!(
            identity_id = %identity_id,
            expires_at = ?token.expires_at,
            "stored token"
        );
        self.inner
            .tokens
            .lock()
            .unwrap()
            .insert(identity_id.clone(), token.clone());
        if self.inner.auto_refresh && token.expires_at.is_some() {
            schedule_refresh(&self.inner, &token);
        }
    }

    /// The stored token, dropping it if it has already expired.
    pub fn get_token(&self, identity_id: &str) -> Option<AuthToken> {
        let token = self.inner.tokens.lock().unwrap().get(identity_id).cloned()?;
        if token.is_expired() {
            warn!(identity_id, "stored token expired");
            self.remove_token(identity_id);
            return None;
        }
        Some(token)
    }

    /// The stored token iff it is currently valid.
    pub fn get_valid_token(&self, identity_id: &str) -> Option<AuthToken> {
        self.get_token(identity_id).filter(AuthToken::is_valid)
    }

    pub fn remove_token(&self, identity_id: &str) -> bool {
        if let Some(task) = self.inner.tasks.lock().unwrap().remove(identity_id) {
            task.abort();
        }
        self.inner.tokens.lock().unwrap().remove(identity_id).is_some()
    }

    pub fn clear_all(&self) {
        for (_, task) in self.inner.tasks.lock().unwrap().drain() {
            task.abort();
        }
        self.inner.tokens.lock().unwrap().clear();
    }

    pub fn on_token_refreshed(&self, identity_id: impl Into<String>, cb: RefreshedCallback) {
        self.inner
            .refreshed_callbacks
            .lock()
            .unwrap()
            .insert(identity_id.into(), cb);
    }

    pub fn on_token_expired(&self, identity_id: impl Into<String>, cb: ExpiredCallback) {
        self.inner
            .expired_callbacks
            .lock()
            .unwrap()
            .insert(identity_id.into(), cb);
    }

    pub fn summary(&self) -> Vec<TokenSummary> {
        let tokens = self.inner.tokens.lock().unwrap();
        let mut out: Vec<TokenSummary> = tokens
            .values()
            .map(|t| TokenSummary {
                identity_id: t.identity_id.clone(),
                token_type: t.token_type.clone(),
                expires_in_secs: t.expires_in_secs(),
                is_valid: t.is_valid(),
                has_refresh_token: t.refresh_token.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        out
    }

    /// Cancel every refresh task. Tokens stay queryable.
    pub fn shutdown(&self) {
        for (_, task) in self.inner.tasks.lock().unwrap().drain() {
            task.abort();
        }
        debug!("token manager shut down");
    }
}

fn schedule_refresh(inner: &Arc<TmInner>, token: &AuthToken) {
    let expires_at = match token.expires_at {
        Some(e) => e,
        None => return,
    };
    let identity_id = token.identity_id.clone();
    let fire_at = expires_at - inner.refresh_buffer.as_secs() as i64;
    let delay = Duration::from_secs((fire_at - now_secs()).max(0) as u64);
    debug!(identity_id = %identity_id, delay_secs = delay.as_secs(), "scheduled token refresh");

    let weak = Arc::downgrade(inner);
    let id_for_task = identity_id.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        run_refresh(weak, id_for_task).await;
    });
    if let Some(previous) = inner.tasks.lock().unwrap().insert(identity_id, task) {
        previous.abort();
    }
}

async fn run_refresh(weak: Weak<TmInner>, identity_id: String) {
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    let token = match inner.tokens.lock().unwrap().get(&identity_id).cloned() {
        Some(token) => token,
        None => return,
    };
    let refresher = inner.refresher.lock().unwrap().clone();

    let refreshed = match refresher {
        Some(refresher) => refresher.refresh(token).await,
        None => Err(ClientError::TokenExpired(identity_id.clone())),
    };

    match refreshed {
        Ok(new_token) => {
            info!(identity_id = %identity_id, "token refreshed");
            inner
                .tokens
                .lock()
                .unwrap()
                .insert(identity_id.clone(), new_token.clone());
            schedule_refresh(&inner, &new_token);
            let cb = inner
                .refreshed_callbacks
                .lock()
                .unwrap()
                .get(&identity_id)
                .cloned();
            if let Some(cb) = cb {
                cb(&new_token);
            }
        }
        Err(e) => {
            warn!(identity_id = %identity_id, error = %e, "token refresh failed, dropping token");
            inner.tokens.lock().unwrap().remove(&identity_id);
            inner.tasks.lock().unwrap().remove(&identity_id);
            let cb = inner
                .expired_callbacks
                .lock()
                .unwrap()
                .get(&identity_id)
                .cloned();
            if let Some(cb) = cb {
                cb(&identity_id);
            }
        }
    }
}
