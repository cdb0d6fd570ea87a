//! Cross-dialect behavior end to end: a client configured for dialect C
//! consumes PascalCase wire rows and yields canonical typed values equal
//! to the originals under structural equality.

use std::time::Duration;

use serde_json::json;
use sd_core::{Player, TableRow};
use sd_protocol::dialect::DialectAdapter;
use sd_test_utils::MockGameServer;
use stardrift_client::protocol::{Dialect, WireFormat};
use stardrift_client::{ClientConfig, GameClient};

fn test_config(port: u16, dialect: Dialect) -> ClientConfig {
    ClientConfig {
        dialect,
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

fn canonical_player() -> TableRow {
    serde_json::from_value(json!({
        "entity_id": 42,
        "player_id": 7,
        "name": "P1",
        "identity_id": "abc123",
        "position": {"x": 1.5, "y": -2.5},
        "velocity": {"x": 0.5, "y": 0.0},
        "mass": 25.0,
        "score": 900,
        "state": "active",
        "created_at": 1_700_000_000_123_000i64,
    }))
    .unwrap()
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
async fn dialect_c_wire_rows_decode_to_canonical_values() {
    let adapter = DialectAdapter::new(Dialect::C);
    let wire_row = adapter.to_server(&canonical_player(), "player");
    // Sanity: the wire form really is PascalCase with ms timestamps.
    assert!(wire_row.contains("EntityId"));
    assert!(wire_row.contains("CreatedAt"));

    let server = MockGameServer::start().await.unwrap();
    server.handle().seed_table("player", vec![wire_row]);
    let client = GameClient::new(test_config(server.local_addr().port(), Dialect::C));
    client.connect().await.unwrap();
    client.subscribe(&["player"]).await.unwrap();

    assert!(wait_for(|| client.get_all_players().len() == 1, Duration::from_secs(2)).await);
    let got = &client.get_all_players()[0];
    let expected = Player::try_from(&canonical_player()).unwrap();
    assert_eq!(got, &expected);
    client.shutdown().await;
}

#[tokio::test]
async fn dialect_a_short_renames_decode_identically() {
    let adapter = DialectAdapter::new(Dialect::A);
    let wire_row = adapter.to_server(&canonical_player(), "player");
    assert!(wire_row.contains("id"));
    assert!(wire_row.contains("created"));

    let server = MockGameServer::start().await.unwrap();
    server.handle().seed_table("player", vec![wire_row]);
    let client = GameClient::new(test_config(server.local_addr().port(), Dialect::A));
    client.connect().await.unwrap();
    client.subscribe(&["player"]).await.unwrap();

    assert!(wait_for(|| client.get_all_players().len() == 1, Duration::from_secs(2)).await);
    let got = &client.get_all_players()[0];
    let expected = Player::try_from(&canonical_player()).unwrap();
    assert_eq!(got, &expected);
    client.shutdown().await;
}

#[tokio::test]
async fn equal_mass_means_equal_radius_across_dialects() {
    let mut per_dialect_radius = Vec::new();
    for dialect in [Dialect::A, Dialect::B, Dialect::C, Dialect::D] {
        let adapter = DialectAdapter::new(dialect);
        let wire_row = adapter.to_server(&canonical_player(), "player");
        let back = adapter.from_server(&wire_row, "player");
        let player = Player::try_from(&back).unwrap();
        per_dialect_radius.push(player.radius());
    }
    assert!(per_dialect_radius.windows(2).all(|w| w[0] == w[1]));
}
