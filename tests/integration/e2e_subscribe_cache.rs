//! Subscription and cache behavior against the mock server: empty
//! initial snapshots, delta application order, and the cache/event
//! correspondence.

use std::time::Duration;

use serde_json::json;
use sd_test_utils::MockGameServer;
use stardrift_client::protocol::{Dialect, DeltaOp, WireFormat};
use stardrift_client::subscription::SubscriptionState;
use stardrift_client::{ClientConfig, GameClient};

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

fn player_row(player_id: u64, name: &str) -> sd_core::TableRow {
    serde_json::from_value(json!({
        "entity_id": player_id,
        "player_id": player_id,
        "name": name,
        "identity_id": "test-identity",
        "position": {"x": 0.0, "y": 0.0},
        "mass": 10.0,
        "score": 0,
        "state": "active",
        "created_at": 1_700_000_000_000_000i64,
    }))
    .unwrap()
}

fn entity_row(entity_id: u64, x: f64, mass: f64) -> sd_core::TableRow {
    serde_json::from_value(json!({
        "entity_id": entity_id,
        "position": {"x": x, "y": 0.0},
        "mass": mass,
        "kind": "food",
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
async fn empty_snapshot_still_activates_and_deltas_populate() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    // Table "player" is empty on the server.
    client.subscribe(&["player"]).await.unwrap();
    assert!(
        wait_for(
            || client.subscription_state("player") == SubscriptionState::Active,
            Duration::from_secs(2)
        )
        .await,
        "empty snapshot must still activate the subscription"
    );
    assert!(client.get_all_players().is_empty());

    // A later insert delta populates the cache with no re-subscription.
    server
        .handle()
        .push_delta("player", DeltaOp::Insert, player_row(7, "P1"));
    assert!(
        wait_for(|| client.get_all_players().len() == 1, Duration::from_secs(2)).await
    );
    let players = client.get_all_players();
    assert_eq!(players[0].player_id, 7);
    assert_eq!(players[0].name, "P1");

    client.shutdown().await;
}

#[tokio::test]
async fn initial_snapshot_is_delivered_in_bulk() {
    let server = MockGameServer::start().await.unwrap();
    server
        .handle()
        .seed_table("entity", vec![entity_row(1, 0.0, 4.0), entity_row(2, 10.0, 9.0)]);
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();

    client.subscribe(&["entity"]).await.unwrap();
    assert!(
        wait_for(|| client.get_all_entities().len() == 2, Duration::from_secs(2)).await
    );
    // Radius derives from mass identically for every cached entity.
    for entity in client.get_all_entities() {
        assert_eq!(entity.radius(), entity.mass.sqrt());
    }
    client.shutdown().await;
}

#[tokio::test]
async fn deltas_apply_in_arrival_order_and_match_cache() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.subscribe(&["entity"]).await.unwrap();
    assert!(
        wait_for(
            || client.subscription_state("entity") == SubscriptionState::Active,
            Duration::from_secs(2)
        )
        .await
    );

    let handle = server.handle();
    handle.push_delta("entity", DeltaOp::Insert, entity_row(1, 0.0, 4.0));
    handle.push_delta("entity", DeltaOp::Insert, entity_row(2, 5.0, 4.0));
    handle.push_delta("entity", DeltaOp::Update, entity_row(1, 3.0, 6.0));
    handle.push_delta("entity", DeltaOp::Insert, entity_row(3, 9.0, 1.0));
    handle.push_delta("entity", DeltaOp::Delete, entity_row(2, 5.0, 4.0));

    // Inserts minus deletes equals cache contents at quiescence.
    assert!(
        wait_for(
            || {
                let entities = client.get_all_entities();
                entities.len() == 2
                    && entities.iter().any(|e| {
                        e.entity_id == sd_core::EntityId::Num(1) && e.mass == 6.0
                    })
            },
            Duration::from_secs(2)
        )
        .await
    );
    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_key_insert_is_treated_as_update() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.subscribe(&["entity"]).await.unwrap();

    let handle = server.handle();
    handle.push_delta("entity", DeltaOp::Insert, entity_row(1, 0.0, 4.0));
    handle.push_delta("entity", DeltaOp::Insert, entity_row(1, 8.0, 16.0));

    assert!(
        wait_for(
            || {
                let entities = client.get_all_entities();
                entities.len() == 1 && entities[0].mass == 16.0
            },
            Duration::from_secs(2)
        )
        .await
    );
    client.shutdown().await;
}

#[tokio::test]
async fn entities_near_scans_the_cache() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().seed_table(
        "entity",
        vec![
            entity_row(1, 0.0, 1.0),
            entity_row(2, 3.0, 1.0),
            entity_row(3, 50.0, 1.0),
        ],
    );
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.subscribe(&["entity"]).await.unwrap();
    assert!(
        wait_for(|| client.get_all_entities().len() == 3, Duration::from_secs(2)).await
    );

    let near = client.get_entities_near(sd_core::Vec2::ZERO, 5.0);
    assert_eq!(near.len(), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn clear_table_cache_leaves_subscription_intact() {
    let server = MockGameServer::start().await.unwrap();
    server.handle().seed_table("entity", vec![entity_row(1, 0.0, 1.0)]);
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.subscribe(&["entity"]).await.unwrap();
    assert!(
        wait_for(|| client.get_all_entities().len() == 1, Duration::from_secs(2)).await
    );

    client.clear_table_cache(Some("entity"));
    assert!(client.get_all_entities().is_empty());
    assert_eq!(client.subscription_state("entity"), SubscriptionState::Active);

    // The still-active subscription keeps applying deltas.
    server
        .handle()
        .push_delta("entity", DeltaOp::Insert, entity_row(4, 1.0, 1.0));
    assert!(
        wait_for(|| client.get_all_entities().len() == 1, Duration::from_secs(2)).await
    );
    client.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_transitions_to_inactive() {
    let server = MockGameServer::start().await.unwrap();
    let client = GameClient::new(test_config(server.local_addr().port()));
    client.connect().await.unwrap();
    client.subscribe(&["player", "entity"]).await.unwrap();
    assert!(
        wait_for(
            || client.subscription_state("player") == SubscriptionState::Active,
            Duration::from_secs(2)
        )
        .await
    );

    client.unsubscribe(&["player"]).await.unwrap();
    assert_eq!(
        client.subscription_state("player"),
        SubscriptionState::Inactive
    );
    assert_eq!(
        client.subscription_state("entity"),
        SubscriptionState::Active
    );
    client.shutdown().await;
}
