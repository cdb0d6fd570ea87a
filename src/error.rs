//! Client error taxonomy.
//!
//! Tagged variants grouped by layer: transport, authentication, data,
//! domain, control. Retryability is a property of the variant, with the
//! error value itself able to veto (`is_retryable`); the resilience layer
//! additionally filters by [`ErrorGroup`].

use std::time::Duration;

use sd_core::RowError;
use sd_protocol::PipelineError;

/// Coarse classification used by retry policies and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorGroup {
    Transport,
    Authentication,
    Data,
    Domain,
    Control,
    Config,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    // -- transport --
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    // -- authentication --
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("token expired for identity {0}")]
    TokenExpired(String),
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    // -- data --
    #[error("validation failed at '{field}': {message}")]
    Validation { field: String, message: String },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("schema version mismatch: {0}")]
    SchemaVersionMismatch(String),

    // -- domain --
    #[error("game state error: {0}")]
    GameState(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // -- control --
    #[error("circuit open: {0}")]
    CircuitOpen(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // -- startup --
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn group(&self) -> ErrorGroup {
        match self {
            ClientError::ConnectionLost(_)
            | ClientError::ServerUnavailable(_)
            | ClientError::Timeout(_)
            | ClientError::ProtocolMismatch(_) => ErrorGroup::Transport,
            ClientError::Unauthenticated(_)
            | ClientError::TokenExpired(_)
            | ClientError::SignatureInvalid(_) => ErrorGroup::Authentication,
            ClientError::Validation { .. }
            | ClientError::Decode(_)
            | ClientError::SchemaVersionMismatch(_) => ErrorGroup::Data,
            ClientError::GameState(_) | ClientError::PermissionDenied(_) => ErrorGroup::Domain,
            ClientError::CircuitOpen(_)
            | ClientError::Cancelled(_)
            | ClientError::DeadlineExceeded(_) => ErrorGroup::Control,
            ClientError::Config(_) => ErrorGroup::Config,
        }
    }

    /// Whether the error admits a retry at the layer that raised it.
    ///
    /// Transport errors are retryable except protocol mismatches; every
    /// other group requires intervention (re-authentication, fixed input,
    /// or operator action) before a retry can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost(_)
                | ClientError::ServerUnavailable(_)
                | ClientError::Timeout(_)
        )
    }

    /// Map a server-reported error code onto the taxonomy.
    pub fn from_server_code(code: &str, message: &str) -> ClientError {
        use sd_protocol::error_codes as codes;
        match code {
            codes::UNAUTHENTICATED => ClientError::Unauthenticated(message.to_owned()),
            codes::PERMISSION_DENIED => ClientError::PermissionDenied(message.to_owned()),
            codes::VALIDATION_ERROR => ClientError::Validation {
                field: String::new(),
                message: message.to_owned(),
            },
            codes::GAME_STATE_ERROR => ClientError::GameState(message.to_owned()),
            _ => ClientError::ServerUnavailable(format!("{}: {}", code, message)),
        }
    }
}

impl From<RowError> for ClientError {
    fn from(err: RowError) -> Self {
        ClientError::Validation {
            field: err.field().to_owned(),
            message: err.to_string(),
        }
    }
}

impl From<PipelineError> for ClientError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(row_err) => row_err.into(),
            PipelineError::Encode(msg) => ClientError::Decode(msg),
            PipelineError::Decode(msg) => ClientError::Decode(msg),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ClientError::ConnectionLost("gone".into()).is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ClientError::ProtocolMismatch("v2".into()).is_retryable());
    }

    #[test]
    fn auth_data_domain_control_are_not_retryable() {
        assert!(!ClientError::SignatureInvalid("bad".into()).is_retryable());
        assert!(!ClientError::Decode("bad json".into()).is_retryable());
        assert!(!ClientError::PermissionDenied("nope".into()).is_retryable());
        assert!(!ClientError::CircuitOpen("auth".into()).is_retryable());
        assert!(!ClientError::Cancelled("caller".into()).is_retryable());
    }

    #[test]
    fn groups_partition_the_taxonomy() {
        assert_eq!(
            ClientError::ServerUnavailable("x".into()).group(),
            ErrorGroup::Transport
        );
        assert_eq!(
            ClientError::TokenExpired("id".into()).group(),
            ErrorGroup::Authentication
        );
        assert_eq!(
            ClientError::GameState("x".into()).group(),
            ErrorGroup::Domain
        );
        assert_eq!(
            ClientError::DeadlineExceeded("x".into()).group(),
            ErrorGroup::Control
        );
    }

    #[test]
    fn row_errors_convert_with_field_path() {
        let row_err = RowError::MissingField {
            row_id: "7".into(),
            field: "mass".into(),
        };
        match ClientError::from(row_err) {
            ClientError::Validation { field, .. } => assert_eq!(field, "mass"),
            other => panic!("expected validation error, got: {:?}", other),
        }
    }

    #[test]
    fn server_codes_map_to_variants() {
        assert_eq!(
            ClientError::from_server_code("PERMISSION_DENIED", "no").group(),
            ErrorGroup::Domain
        );
        assert_eq!(
            ClientError::from_server_code("TEMPORARY_ERROR", "busy").group(),
            ErrorGroup::Transport
        );
    }
}
