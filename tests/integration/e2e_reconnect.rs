//! Reconnection: killing live sessions drives the state machine through
//! Reconnecting → Connecting → Connected, the bus drops nothing, and
//! calls succeed once the session is back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sd_test_utils::MockGameServer;
use stardrift_client::connection::ConnectionState;
use stardrift_client::events::bus::EventHandler;
use stardrift_client::events::{EventFilter, EventKind};
use stardrift_client::protocol::{Dialect, WireFormat};
use stardrift_client::{ClientConfig, GameClient};

fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        dialect: Dialect::B,
        host: "127.0.0.1".to_owned(),
        port,
        use_ssl: false,
        connection_timeout: Duration::from_secs(5),
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(30),
        log_level: stardrift_client::config::LogLevel::Warn,
        db_identity: String::new(),
        wire_format: WireFormat::Text,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn session_drop_triggers_reconnect_and_calls_resume() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));

    // Record every connection state transition off the event bus.
    let transitions: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    client.on_event(
        "state_recorder",
        EventFilter::for_kinds([EventKind::Connection]),
        EventHandler::from_async(move |event| {
            let sink = sink.clone();
            async move {
                let old = event.data["old_state"].as_str().unwrap_or("").to_owned();
                let new = event.data["new_state"].as_str().unwrap_or("").to_owned();
                sink.lock().unwrap().push((old, new));
            }
        }),
    );

    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(client
        .call_reducer("enter_game", json!({"player_name": "P1"}), None)
        .await
        .unwrap()
        .is_success());

    server.handle().drop_connections();
    assert!(
        wait_for(
            || client.connection_state() == ConnectionState::Connected
                && transitions
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(old, _)| old == "reconnecting"),
            Duration::from_secs(5)
        )
        .await,
        "client should reconnect after the session drops"
    );

    // Observed sequence includes the full loop.
    {
        let seen = transitions.lock().unwrap().clone();
        let expect = [
            ("connected", "reconnecting"),
            ("reconnecting", "connecting"),
            ("connecting", "connected"),
        ];
        for pair in expect {
            assert!(
                seen.iter().any(|(old, new)| (old.as_str(), new.as_str()) == pair),
                "missing transition {:?} in {:?}",
                pair,
                seen
            );
        }
    }

    // Calls succeed on the fresh session.
    assert!(client
        .call_reducer("enter_game", json!({"player_name": "P1"}), None)
        .await
        .unwrap()
        .is_success());

    // Nothing was dropped by the bus along the way.
    client.event_bus().wait_until_idle().await;
    assert_eq!(client.event_bus().metrics().dropped, 0);
    client.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_reach_the_absorbing_failed_state() {
    let server = MockGameServer::start().await.unwrap();
    let port = server.local_addr().port();
    let client = GameClient::new(test_config(port));
    client.connect().await.unwrap();

    // Stop the listener and kill the live session so reconnects cannot
    // succeed.
    let handle = server.handle();
    drop(server);
    handle.drop_connections();
    assert!(
        wait_for(
            || client.connection_state() == ConnectionState::Failed,
            Duration::from_secs(10)
        )
        .await,
        "retry exhaustion must land in Failed"
    );

    // Failed is absorbing: connect() refuses.
    assert!(client.connect().await.is_err());
    client.shutdown().await;
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    // A disconnected client can connect again.
    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    client.shutdown().await;
}
