//! Mock WebSocket game server.
//!
//! Protocol behavior:
//! - `subscribe` → one `subscribe_ack` per table, then one `initial_data`
//!   per table with the seeded rows (possibly empty).
//! - `unsubscribe` → one `subscribe_ack` per table.
//! - `reducer_call` → scripted failure if one is queued for that reducer,
//!   otherwise success echoing the arguments as the payload.
//! - `auth_claim` → scripted rejections first; then, when challenges are
//!   enabled and the claim carries no response, an `auth_challenge`;
//!   finally signature verification and a token grant.
//!
//! Deltas pushed with [`MockServerHandle::push_delta`] broadcast to every
//! live session. [`MockServerHandle::drop_connections`] kills live
//! sessions without stopping the listener, so clients reconnect.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::Message;

use sd_core::TableRow;
use sd_protocol::*;

/// A reducer response queued by a test.
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub error_code: String,
    pub error_message: String,
}

#[derive(Default)]
struct ServerState {
    tables: Mutex<HashMap<String, Vec<TableRow>>>,
    reducer_scripts: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    silent_reducers: Mutex<std::collections::HashSet<String>>,
    auth_failures: Mutex<u32>,
    challenge_enabled: Mutex<bool>,
    auth_attempts: AtomicU64,
    reducer_calls: AtomicU64,
}

/// Shared control surface for a running [`MockGameServer`].
#[derive(Clone)]
pub struct MockServerHandle {
    state: Arc<ServerState>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    kill_tx: watch::Sender<u64>,
}

impl MockServerHandle {
    /// Seed (replace) a table's contents served in `initial_data`.
    pub fn seed_table(&self, table: &str, rows: Vec<TableRow>) {
        self.state
            .tables
            .lock()
            .unwrap()
            .insert(table.to_owned(), rows);
    }

    /// Queue a failure for the next call of `reducer`.
    pub fn fail_reducer_once(&self, reducer: &str, error_code: &str, message: &str) {
        self.state
            .reducer_scripts
            .lock()
            .unwrap()
            .entry(reducer.to_owned())
            .or_default()
            .push_back(ScriptedFailure {
                error_code: error_code.to_owned(),
                error_message: message.to_owned(),
            });
    }

    /// Never answer calls to `reducer` (for timeout and cancel tests).
    pub fn silence_reducer(&self, reducer: &str) {
        self.state
            .silent_reducers
            .lock()
            .unwrap()
            .insert(reducer.to_owned());
    }

    /// Reject the next `n` auth claims regardless of signature.
    pub fn fail_auth(&self, n: u32) {
        *self.state.auth_failures.lock().unwrap() = n;
    }

    /// Issue a challenge before accepting claims.
    pub fn enable_challenge(&self, enabled: bool) {
        *self.state.challenge_enabled.lock().unwrap() = enabled;
    }

    /// Broadcast a table delta to every live session.
    pub fn push_delta(&self, table: &str, op: DeltaOp, row: TableRow) {
        let _ = self.broadcast_tx.send(ServerMessage::TableDelta(TableDelta {
            table: table.to_owned(),
            op,
            row,
            old_row: None,
        }));
    }

    /// Broadcast an arbitrary server message.
    pub fn push_message(&self, msg: ServerMessage) {
        let _ = self.broadcast_tx.send(msg);
    }

    /// Kill every live session. The listener keeps accepting, so clients
    /// can reconnect.
    pub fn drop_connections(&self) {
        let next = *self.kill_tx.borrow() + 1;
        let _ = self.kill_tx.send(next);
    }

    pub fn auth_attempts(&self) -> u64 {
        self.state.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn reducer_calls(&self) -> u64 {
        self.state.reducer_calls.load(Ordering::SeqCst)
    }
}

/// The mock server; dropping it stops the accept loop (live sessions are
/// killed separately via [`MockServerHandle::drop_connections`]).
pub struct MockGameServer {
    addr: SocketAddr,
    handle: MockServerHandle,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for MockGameServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl MockGameServer {
    /// Start on a random local port.
    pub async fn start() -> Result<MockGameServer, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (broadcast_tx, _) = broadcast::channel(256);
        let (kill_tx, _) = watch::channel(0u64);
        let handle = MockServerHandle {
            state: Arc::new(ServerState::default()),
            broadcast_tx,
            kill_tx,
        };
        let accept_handle = handle.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let session = accept_handle.clone();
                        tokio::spawn(async move {
                            let _ = handle_session(stream, session).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(MockGameServer {
            addr,
            handle,
            accept_task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of the stream endpoint.
    pub fn url(&self) -> String {
        format!("ws://{}/v1/stream", self.addr)
    }

    pub fn handle(&self) -> MockServerHandle {
        self.handle.clone()
    }
}

async fn handle_session(
    stream: tokio::net::TcpStream,
    server: MockServerHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut broadcast_rx = server.broadcast_tx.subscribe();
    let mut kill_rx = server.kill_tx.subscribe();

    loop {
        tokio::select! {
            _ = kill_rx.changed() => break,
            pushed = broadcast_rx.recv() => {
                if let Ok(msg) = pushed {
                    send(&mut write, &msg).await?;
                }
            }
            frame = read.next() => {
                let msg = match frame {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                };
                let parsed: ClientMessage = match serde_json::from_str(&msg) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        send(&mut write, &ServerMessage::Error(ErrorMessage {
                            code: "PROTOCOL_ERROR".to_owned(),
                            message: "undecodable message".to_owned(),
                            retryable: false,
                        }))
                        .await?;
                        continue;
                    }
                };
                for reply in handle_message(&server, parsed) {
                    send(&mut write, &reply).await?;
                }
            }
        }
    }
    Ok(())
}

async fn send<S>(write: &mut S, msg: &ServerMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

fn handle_message(server: &MockServerHandle, msg: ClientMessage) -> Vec<ServerMessage> {
    match msg {
        ClientMessage::Subscribe(subscribe) => {
            let tables = server.state.tables.lock().unwrap();
            let mut out = Vec::new();
            for table in &subscribe.tables {
                out.push(ServerMessage::SubscribeAck(SubscribeAck {
                    request_id: subscribe.request_id.clone(),
                    table: table.clone(),
                    ok: true,
                    error: None,
                }));
                out.push(ServerMessage::InitialData(InitialData {
                    table: table.clone(),
                    rows: tables.get(table).cloned().unwrap_or_default(),
                }));
            }
            out
        }
        ClientMessage::Unsubscribe(unsubscribe) => unsubscribe
            .tables
            .iter()
            .map(|table| {
                ServerMessage::SubscribeAck(SubscribeAck {
                    request_id: unsubscribe.request_id.clone(),
                    table: table.clone(),
                    ok: true,
                    error: None,
                })
            })
            .collect(),
        ClientMessage::ReducerCall(call) => {
            server.state.reducer_calls.fetch_add(1, Ordering::SeqCst);
            if server
                .state
                .silent_reducers
                .lock()
                .unwrap()
                .contains(&call.reducer)
            {
                return Vec::new();
            }
            let scripted = server
                .state
                .reducer_scripts
                .lock()
                .unwrap()
                .get_mut(&call.reducer)
                .and_then(VecDeque::pop_front);
            let response = match scripted {
                Some(failure) => ReducerResponse {
                    request_id: call.request_id,
                    status: ReducerCallStatus::Failed,
                    payload: None,
                    error_code: Some(failure.error_code),
                    error_message: Some(failure.error_message),
                },
                None => ReducerResponse {
                    request_id: call.request_id,
                    status: ReducerCallStatus::Success,
                    payload: Some(serde_json::json!({
                        "reducer": call.reducer,
                        "args": call.args,
                    })),
                    error_code: None,
                    error_message: None,
                },
            };
            vec![ServerMessage::ReducerResponse(response)]
        }
        ClientMessage::AuthClaim(claim) => {
            server.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut failures = server.state.auth_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return vec![ServerMessage::AuthResult(AuthResult {
                        ok: false,
                        token: None,
                        error: Some("signature rejected".to_owned()),
                    })];
                }
            }
            let challenge_enabled = *server.state.challenge_enabled.lock().unwrap();
            if challenge_enabled && claim.challenge_response.is_none() {
                return vec![ServerMessage::AuthChallenge(AuthChallenge {
                    challenge: BASE64.encode(b"mock-challenge"),
                })];
            }
            if !verify_claim_signature(&claim) {
                return vec![ServerMessage::AuthResult(AuthResult {
                    ok: false,
                    token: None,
                    error: Some("signature invalid".to_owned()),
                })];
            }
            vec![ServerMessage::AuthResult(AuthResult {
                ok: true,
                token: Some(TokenGrant {
                    access_token: format!("mock-token-{}", uuid::Uuid::new_v4()),
                    token_type: "Bearer".to_owned(),
                    expires_in_secs: 3600,
                    refresh_token: Some("mock-refresh".to_owned()),
                    scope: Some("game:read,game:write".to_owned()),
                }),
                error: None,
            })]
        }
    }
}

/// Server-side claim verification, mirroring what a real server does:
/// identity binding (SHA-256 of the public key, truncated and
/// hex-encoded) plus an Ed25519 signature over the canonical claim JSON.
fn verify_claim_signature(claim: &AuthClaim) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let public_key = match BASE64.decode(&claim.public_key) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let digest = Sha256::digest(&public_key);
    if hex::encode(&digest[..16]) != claim.identity_id {
        return false;
    }
    let key_bytes: [u8; 32] = match public_key.as_slice().try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let verifying = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match BASE64
        .decode(&claim.signature)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes).ok())
    {
        Some(signature) => signature,
        None => return false,
    };
    let canonical = format!(
        r#"{{"identity_id":{},"public_key":{},"timestamp":{}}}"#,
        serde_json::to_string(&claim.identity_id).unwrap(),
        serde_json::to_string(&claim.public_key).unwrap(),
        claim.timestamp
    );
    verifying.verify(canonical.as_bytes(), &signature).is_ok()
}
