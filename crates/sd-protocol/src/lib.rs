// sd-protocol: wire message types, dialect adapters and the serialization
// pipeline for the game server protocol.
//
// All stream messages use a top-level `kind` field for discriminated
// deserialization. The transport layer is dialect-agnostic: rows inside
// messages are adapted per dialect by the pipeline, not by the codec.

use serde::{Deserialize, Serialize};

use sd_core::TableRow;

pub mod binary;
pub mod dialect;
pub mod pipeline;
pub mod schema;

pub use dialect::Dialect;
pub use pipeline::{PipelineConfig, PipelineError, PipelineMetricsSnapshot, SerializationPipeline, WireFormat};
pub use schema::{FieldKind, FieldSpec, TypeSchema};

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// Subscribe to one or more tables.
///
/// The server replies with one `subscribe_ack` per table, then streams the
/// initial snapshot (`initial_data`, possibly empty) followed by deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub request_id: String,
    pub tables: Vec<String>,
}

/// Unsubscribe from one or more tables. Acked per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub request_id: String,
    pub tables: Vec<String>,
}

/// Invoke a named server-side reducer.
///
/// `request_id` correlates the eventual `reducer_response`; it is unique
/// per client for the lifetime of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerCall {
    pub request_id: String,
    pub reducer: String,
    pub args: serde_json::Value,
}

/// Signed authentication claim.
///
/// `signature` covers the canonical JSON of the claim fields (sorted keys,
/// signature field absent). When answering a server challenge the same
/// message is re-sent with `challenge_response` carrying the base64 Ed25519
/// signature over the raw challenge bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthClaim {
    pub identity_id: String,
    /// Base64-encoded Ed25519 public key.
    pub public_key: String,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_response: Option<String>,
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Per-table acknowledgement of a `subscribe` or `unsubscribe` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAck {
    pub request_id: String,
    pub table: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The full current contents of a table at subscription time.
///
/// An empty `rows` list is a normal outcome for a table with no data yet;
/// the subscription still becomes active and subsequent deltas apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialData {
    pub table: String,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    Insert,
    Update,
    Delete,
}

/// One incremental change to a subscribed table.
///
/// `old_row` is present only for updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDelta {
    pub table: String,
    pub op: DeltaOp,
    pub row: TableRow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<TableRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerCallStatus {
    Success,
    Failed,
}

/// Server response to a `reducer_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerResponse {
    pub request_id: String,
    pub status: ReducerCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Challenge issued by the server in response to an `auth_claim`.
///
/// The challenge is opaque: the client signs exactly the decoded bytes and
/// must not assume any structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Base64-encoded challenge bytes.
    pub challenge: String,
}

/// Token grant returned on successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Scheme tag, e.g. "Bearer".
    pub token_type: String,
    pub expires_in_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Server heartbeat; carries the server clock in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

/// Well-known server error codes.
pub mod error_codes {
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    pub const TEMPORARY_ERROR: &str = "TEMPORARY_ERROR";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const GAME_STATE_ERROR: &str = "GAME_STATE_ERROR";

    /// Server-reported codes the client may retry.
    pub fn is_retryable(code: &str) -> bool {
        matches!(code, SERVER_ERROR | TEMPORARY_ERROR | RATE_LIMITED)
    }
}

/// Protocol-level error message.
///
/// | Code              | Retryable |
/// |-------------------|-----------|
/// | SERVER_ERROR      | true      |
/// | TEMPORARY_ERROR   | true      |
/// | RATE_LIMITED      | true      |
/// | VALIDATION_ERROR  | false     |
/// | UNAUTHENTICATED   | false     |
/// | PERMISSION_DENIED | false     |
/// | GAME_STATE_ERROR  | false     |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Top-level discriminated unions
// ---------------------------------------------------------------------------

/// All client-to-server message kinds.
///
/// ```json
/// { "kind": "reducer_call", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    ReducerCall(ReducerCall),
    AuthClaim(AuthClaim),
}

/// All server-to-client message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    SubscribeAck(SubscribeAck),
    InitialData(InitialData),
    TableDelta(TableDelta),
    ReducerResponse(ReducerResponse),
    AuthChallenge(AuthChallenge),
    AuthResult(AuthResult),
    Heartbeat(Heartbeat),
    Error(ErrorMessage),
}
