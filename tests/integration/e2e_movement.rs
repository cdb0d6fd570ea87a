//! Full gameplay loop against a dialect A server: authenticate, join,
//! send movement input, observe the player row move across ticks.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use sd_core::{TableRow, Vec2};
use sd_protocol::dialect::DialectAdapter;
use sd_test_utils::MockGameServer;
use stardrift_client::auth::Identity;
use stardrift_client::protocol::{Dialect, DeltaOp, WireFormat};
use stardrift_client::{ClientConfig, GameClient};

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

fn player_tick(x: f64, vx: f64) -> TableRow {
    let canonical: TableRow = serde_json::from_value(json!({
        "entity_id": 1,
        "player_id": 1,
        "name": "P1",
        "identity_id": "test-identity",
        "position": {"x": x, "y": 0.0},
        "velocity": {"x": vx, "y": 0.0},
        "mass": 10.0,
        "score": 0,
        "state": "active",
        "created_at": 1_700_000_000_000_000i64,
    }))
    .unwrap();
    // The server speaks dialect A on the wire.
    DialectAdapter::new(Dialect::A).to_server(&canonical, "player")
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
async fn join_move_and_observe_motion() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    let identity = Identity::generate("mover", BTreeMap::new());
    client.authenticate(&identity).await.unwrap();
    client.subscribe(&["player"]).await.unwrap();

    let joined = client.enter_game("P1").await.unwrap();
    assert!(joined.is_success());

    // Movement input is normalized before transmit.
    let moved = client.update_player_input(Vec2::new(3.0, 0.0)).await.unwrap();
    assert!(moved.is_success());
    let args = &moved.payload.as_ref().unwrap()["args"];
    assert_eq!(args["direction"]["x"], 1.0);
    assert_eq!(args["direction"]["y"], 0.0);

    // Three ticks of server updates: velocity.x stays positive, position
    // is monotone non-decreasing in x.
    let handle = server.handle();
    handle.push_delta("player", DeltaOp::Insert, player_tick(0.0, 1.0));
    handle.push_delta("player", DeltaOp::Update, player_tick(1.0, 1.0));
    handle.push_delta("player", DeltaOp::Update, player_tick(2.5, 1.0));

    assert!(
        wait_for(
            || {
                client
                    .get_all_players()
                    .first()
                    .map(|p| p.position.x == 2.5)
                    .unwrap_or(false)
            },
            Duration::from_secs(2)
        )
        .await
    );
    let player = &client.get_all_players()[0];
    assert!(player.velocity.unwrap().x > 0.0);
    assert_eq!(player.name, "P1");

    // Split and leave round out the input surface.
    assert!(client.player_split().await.unwrap().is_success());
    assert!(client.leave_game().await.is_some());
    client.shutdown().await;
}

#[tokio::test]
async fn stats_surface_reflects_activity() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.enter_game("P1").await.unwrap();

    client.event_bus().wait_until_idle().await;
    let stats = client.stats();
    assert_eq!(
        stats.connection_state,
        stardrift_client::connection::ConnectionState::Connected
    );
    assert!(stats.reducers.calls >= 1);
    assert!(stats.reducers.successes >= 1);
    assert!(stats.events.published >= 1);
    client.shutdown().await;
}
