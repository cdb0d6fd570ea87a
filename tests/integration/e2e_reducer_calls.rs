//! Reducer dispatcher behavior: correlation, retry classification,
//! timeouts, cancellation and the three call variants.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sd_test_utils::MockGameServer;
use stardrift_client::connection::{ConnectionConfig, ConnectionManager, WsConnector};
use stardrift_client::events::{EventBus, EventBusConfig};
use stardrift_client::protocol::{Dialect, ServerMessage, WireFormat};
use stardrift_client::reducer::{DispatcherConfig, ReducerDispatcher, ReducerStatus};
use stardrift_client::{ClientConfig, ClientError, GameClient};

fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        dialect: Dialect::B,
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

/// A dispatcher with fast retry/timeout settings, wired straight to the
/// mock server.
async fn fast_dispatcher(server: &MockGameServer) -> (ReducerDispatcher, ConnectionManager) {
    let bus = EventBus::new(EventBusConfig::default());
    let connector = Arc::new(WsConnector::new(server.url(), Duration::from_secs(5)));
    let (connection, mut inbound_rx) =
        ConnectionManager::new(connector, ConnectionConfig::default(), bus.clone());
    let dispatcher = ReducerDispatcher::new(
        connection.clone(),
        bus,
        Dialect::B,
        DispatcherConfig {
            default_timeout: Duration::from_millis(300),
            max_retries: 2,
            retry_base: Duration::from_millis(20),
            retry_cap: Duration::from_millis(100),
            grace: Duration::from_millis(200),
        },
    );
    let route_to = dispatcher.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            if let ServerMessage::ReducerResponse(response) = msg {
                route_to.handle_response(response);
            }
        }
    });
    connection.connect().await.unwrap();
    (dispatcher, connection)
}

#[tokio::test]
async fn successful_call_echoes_payload_and_clears_pending() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    let result = client
        .call_reducer("enter_game", json!({"player_name": "P1"}), None)
        .await
        .unwrap();
    assert!(result.is_success());
    let payload = result.payload.unwrap();
    assert_eq!(payload["reducer"], "enter_game");
    assert_eq!(payload["args"]["player_name"], "P1");
    // Response removes the pending entry.
    assert_eq!(client.reducer_dispatcher().pending_count(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn retryable_server_errors_are_retried() {
    let server = MockGameServer::start().await.unwrap();
    server
        .handle()
        .fail_reducer_once("enter_game", "TEMPORARY_ERROR", "try later");
    let (dispatcher, connection) = fast_dispatcher(&server).await;

    let result = dispatcher
        .call("enter_game", json!({"player_name": "P1"}), None)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(server.handle().reducer_calls(), 2);
    assert_eq!(dispatcher.stats().retries, 1);
    connection.disconnect().await;
}

#[tokio::test]
async fn validation_errors_are_not_retried() {
    let server = MockGameServer::start().await.unwrap();
    server
        .handle()
        .fail_reducer_once("enter_game", "VALIDATION_ERROR", "bad name");
    let (dispatcher, connection) = fast_dispatcher(&server).await;

    let result = dispatcher
        .call("enter_game", json!({"player_name": ""}), None)
        .await
        .unwrap();
    assert_eq!(result.status, ReducerStatus::Failed);
    assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert_eq!(server.handle().reducer_calls(), 1);
    connection.disconnect().await;
}

#[tokio::test]
async fn unanswered_call_times_out_after_retries() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().silence_reducer("slow_poke");
    let (dispatcher, connection) = fast_dispatcher(&server).await;

    let result = dispatcher.call("slow_poke", json!({}), None).await.unwrap();
    assert_eq!(result.status, ReducerStatus::Timeout);
    // Initial attempt plus two retries.
    assert_eq!(server.handle().reducer_calls(), 3);
    connection.disconnect().await;
}

#[tokio::test]
async fn cancel_suppresses_delivery_and_resolves_caller() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().silence_reducer("slow_poke");
    let (dispatcher, connection) = fast_dispatcher(&server).await;

    let call_dispatcher = dispatcher.clone();
    let call = tokio::spawn(async move {
        call_dispatcher
            .call("slow_poke", json!({}), Some(Duration::from_secs(10)))
            .await
    });
    // Let the request transmit, then cancel it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = dispatcher.pending_requests();
    assert_eq!(pending.len(), 1);
    assert!(dispatcher.cancel(&pending[0]));

    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status, ReducerStatus::Cancelled);
    connection.disconnect().await;
}

#[tokio::test]
async fn strict_and_safe_variants() {
    let server = MockGameServer::start().await.unwrap();
    server
        .handle()
        .fail_reducer_once("enter_game", "PERMISSION_DENIED", "banned");
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    // Strict raises a typed error for the server-reported failure.
    let err = client
        .call_reducer_strict("enter_game", json!({"player_name": "P1"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PermissionDenied(_)));

    // Safe swallows failures into None, successes into Some.
    server
        .handle()
        .fail_reducer_once("enter_game", "GAME_STATE_ERROR", "mid-tick");
    assert!(client
        .call_reducer_safe("enter_game", json!({"player_name": "P1"}), None)
        .await
        .is_none());
    assert!(client
        .call_reducer_safe("enter_game", json!({"player_name": "P1"}), None)
        .await
        .is_some());
    client.shutdown().await;
}
