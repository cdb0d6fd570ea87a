//! Signed authentication handshake.
//!
//! The client sends a claim (identity id, base64 public key, timestamp)
//! signed over its canonical JSON form. If the server answers with a
//! challenge, the client signs the raw challenge bytes (no structure is
//! assumed) and re-sends the claim with the challenge response attached.
//! A successful handshake yields a token grant.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use sd_protocol::{AuthClaim, ClientMessage, ServerMessage};

use crate::auth::identity::{derive_identity_id, Identity};
use crate::auth::token::AuthToken;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::events::event::now_micros;

/// Canonical claim encoding: fixed field order (sorted keys), no
/// whitespace. Both signer and verifier derive these bytes the same way.
pub fn canonical_claim_bytes(identity_id: &str, public_key: &str, timestamp: i64) -> Vec<u8> {
    format!(
        r#"{{"identity_id":{},"public_key":{},"timestamp":{}}}"#,
        serde_json::to_string(identity_id).expect("string encodes"),
        serde_json::to_string(public_key).expect("string encodes"),
        timestamp
    )
    .into_bytes()
}

/// Build a signed claim, optionally answering a server challenge.
pub fn build_claim(identity: &Identity, challenge: Option<&[u8]>) -> Result<AuthClaim, ClientError> {
    let timestamp = now_micros();
    let canonical = canonical_claim_bytes(&identity.identity_id, &identity.public_key, timestamp);
    let signature = BASE64.encode(identity.sign(&canonical)?);
    let challenge_response = match challenge {
        Some(bytes) => Some(BASE64.encode(identity.sign(bytes)?)),
        None => None,
    };
    Ok(AuthClaim {
        identity_id: identity.identity_id.clone(),
        public_key: identity.public_key.clone(),
        timestamp,
        signature,
        challenge_response,
    })
}

/// Verify a claim's identity binding and signature. Used by tests and
/// mock servers; a real server performs the same checks.
pub fn verify_claim(claim: &AuthClaim) -> bool {
    let public_key = match BASE64.decode(&claim.public_key) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    if derive_identity_id(&public_key) != claim.identity_id {
        return false;
    }
    let signature = match BASE64.decode(&claim.signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let canonical =
        canonical_claim_bytes(&claim.identity_id, &claim.public_key, claim.timestamp);
    verify_with_public_key(&public_key, &canonical, &signature)
}

fn verify_with_public_key(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    let key_bytes: [u8; 32] = match public_key.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let verifying = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };
    match Signature::from_slice(signature) {
        Ok(signature) => verifying.verify(data, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Drives the handshake over an established connection.
///
/// The client facade routes `AuthChallenge` and `AuthResult` messages
/// into the flow via [`AuthFlow::deliver`]; `authenticate` consumes them.
pub struct AuthFlow {
    tx: mpsc::Sender<ServerMessage>,
    rx: Mutex<mpsc::Receiver<ServerMessage>>,
}

impl Default for AuthFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthFlow {
    pub fn new() -> AuthFlow {
        let (tx, rx) = mpsc::channel(8);
        AuthFlow {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Hand an auth-related server message to a pending handshake.
    pub fn deliver(&self, msg: ServerMessage) {
        if self.tx.try_send(msg).is_err() {
            warn!("auth message dropped: no handshake in progress");
        }
    }

    /// Run the handshake: claim, optional challenge round, token.
    pub async fn authenticate(
        &self,
        connection: &ConnectionManager,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<AuthToken, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock().await;
        // Drop any stale leftovers from an aborted earlier handshake.
        while rx.try_recv().is_ok() {}

        let claim = build_claim(identity, None)?;
        connection
            .send(ClientMessage::AuthClaim(claim), Some(timeout))
            .await?;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ClientError::Timeout(timeout))?;
            let msg = tokio::time::timeout(remaining, rx.recv())
                .await
                .map_err(|_| ClientError::Timeout(timeout))?
                .ok_or_else(|| ClientError::ConnectionLost("auth channel closed".to_owned()))?;
            match msg {
                ServerMessage::AuthChallenge(challenge) => {
                    debug!("server issued auth challenge");
                    let bytes = BASE64.decode(&challenge.challenge).map_err(|e| {
                        ClientError::ProtocolMismatch(format!("undecodable challenge: {}", e))
                    })?;
                    let claim = build_claim(identity, Some(&bytes))?;
                    connection
                        .send(ClientMessage::AuthClaim(claim), Some(remaining))
                        .await?;
                }
                ServerMessage::AuthResult(result) => {
                    if result.ok {
                        let grant = result.token.ok_or_else(|| {
                            ClientError::ProtocolMismatch(
                                "auth result ok but no token".to_owned(),
                            )
                        })?;
                        return Ok(AuthToken::from_grant(&grant, &identity.identity_id));
                    }
                    let reason = result.error.unwrap_or_else(|| "rejected".to_owned());
                    return Err(ClientError::SignatureInvalid(reason));
                }
                other => {
                    debug!(?other, "ignoring non-auth message during handshake");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn claim_signature_verifies() {
        let identity = Identity::generate("alice", BTreeMap::new());
        let claim = build_claim(&identity, None).unwrap();
        assert!(verify_claim(&claim));
        assert!(claim.challenge_response.is_none());
    }

    #[test]
    fn tampered_claim_fails_verification() {
        let identity = Identity::generate("alice", BTreeMap::new());
        let mut claim = build_claim(&identity, None).unwrap();
        claim.timestamp += 1;
        assert!(!verify_claim(&claim));
    }

    #[test]
    fn identity_binding_is_checked() {
        let alice = Identity::generate("alice", BTreeMap::new());
        let bob = Identity::generate("bob", BTreeMap::new());
        let mut claim = build_claim(&alice, None).unwrap();
        claim.identity_id = bob.identity_id.clone();
        assert!(!verify_claim(&claim));
    }

    #[test]
    fn challenge_response_signs_raw_bytes() {
        let identity = Identity::generate("alice", BTreeMap::new());
        let challenge = b"opaque-server-bytes";
        let claim = build_claim(&identity, Some(challenge)).unwrap();
        let response = BASE64
            .decode(claim.challenge_response.as_deref().unwrap())
            .unwrap();
        assert!(identity.verify(challenge, &response));
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let bytes = canonical_claim_bytes("id", "pk", 42);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"identity_id":"id","public_key":"pk","timestamp":42}"#
        );
    }
}
