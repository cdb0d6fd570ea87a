//! Authentication handshake and the circuit breaker guarding it: a storm
//! of signature failures opens the circuit and the next attempt fails
//! fast without contacting the server.

use std::collections::BTreeMap;
use std::time::Duration;

use sd_test_utils::MockGameServer;
use stardrift_client::auth::Identity;
use stardrift_client::protocol::{Dialect, WireFormat};
use stardrift_client::{ClientConfig, ClientError, GameClient};

fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        dialect: Dialect::A,
        host: "127.0.0.1".to_owned(),
        port,
        use_ssl: false,
        connection_timeout: Duration::from_secs(5),
        reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(50),
        log_level: stardrift_client::config::LogLevel::Warn,
        db_identity: String::new(),
        wire_format: WireFormat::Text,
    }
}

#[tokio::test]
async fn fresh_identity_authenticates_and_stores_a_token() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    let identity = Identity::generate("player-one", BTreeMap::new());
    let token = client.authenticate(&identity).await.unwrap();
    assert!(token.is_valid());
    assert_eq!(token.identity_id, identity.identity_id);
    assert_eq!(token.token_type, "Bearer");

    // Stored under the identity id.
    let stored = client
        .token_manager()
        .get_valid_token(&identity.identity_id)
        .unwrap();
    assert_eq!(stored.token, token.token);
    client.shutdown().await;
}

#[tokio::test]
async fn challenge_round_is_signed_and_accepted() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().enable_challenge(true);
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    let identity = Identity::generate("challenged", BTreeMap::new());
    let token = client.authenticate(&identity).await.unwrap();
    assert!(token.is_valid());
    // Claim, then claim-with-challenge-response.
    assert_eq!(server.handle().auth_attempts(), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn auth_failure_storm_opens_the_circuit() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().fail_auth(5);
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    let identity = Identity::generate("unlucky", BTreeMap::new());
    for _ in 0..5 {
        let err = client.authenticate(&identity).await.unwrap_err();
        assert!(matches!(err, ClientError::SignatureInvalid(_)));
    }
    assert_eq!(server.handle().auth_attempts(), 5);

    // Sixth call fails fast: the server is never contacted.
    let err = client.authenticate(&identity).await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen(_)));
    assert_eq!(server.handle().auth_attempts(), 5);
    client.shutdown().await;
}

#[tokio::test]
async fn tampered_identity_is_rejected_by_signature_check() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    // A claim whose identity id does not match the public key.
    let mut identity = Identity::generate("imposter", BTreeMap::new());
    identity.identity_id = "0000000000000000000000000000dead".to_owned();
    let err = client.authenticate(&identity).await.unwrap_err();
    assert!(matches!(err, ClientError::SignatureInvalid(_)));
    client.shutdown().await;
}
