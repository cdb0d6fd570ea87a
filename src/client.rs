//! The unified game client.
//!
//! Owns every subsystem (connection, auth, subscriptions, reducers,
//! events, resilience) and wires inbound message routing between them.
//! Ownership is one-way: the client owns components; components never
//! hold a reference back to the client. Inbound traffic flows through a
//! channel the router task drains.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sd_core::{Circle, Entity, Player, Vec2};
use sd_protocol::{PipelineConfig, SerializationPipeline, ServerMessage};

use crate::auth::{AuthFlow, AuthToken, Identity, TokenManager};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, TransportConnector, WsConnector,
};
use crate::error::{ClientError, ErrorGroup};
use crate::events::bus::{EventHandler, SubscriptionId};
use crate::events::{Event, EventBus, EventBusConfig, EventFilter, EventMetricsSnapshot};
use crate::reducer::{
    DispatcherConfig, DispatcherStatsSnapshot, ReducerDispatcher, ReducerResult,
};
use crate::resilience::breaker::BreakerSnapshot;
use crate::resilience::{BreakerConfig, CircuitBreaker, RetryConfig};
use crate::subscription::{SubscriptionEngine, SubscriptionState};

/// Aggregate metrics snapshot across components.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub connection_state: ConnectionState,
    pub pipeline: sd_protocol::PipelineMetricsSnapshot,
    pub events: EventMetricsSnapshot,
    pub reducers: DispatcherStatsSnapshot,
    pub auth_breaker: BreakerSnapshot,
}

/// The single object applications talk to.
pub struct GameClient {
    config: ClientConfig,
    bus: EventBus,
    connection: ConnectionManager,
    subscriptions: SubscriptionEngine,
    reducers: ReducerDispatcher,
    tokens: TokenManager,
    auth_flow: Arc<AuthFlow>,
    auth_breaker: Arc<CircuitBreaker>,
    pipeline: Arc<SerializationPipeline>,
    router: Mutex<Option<JoinHandle<()>>>,
    current_player: Mutex<Option<String>>,
}

impl GameClient {
    /// Build a client over the default WebSocket transport.
    pub fn new(config: ClientConfig) -> GameClient {
        let connector: Arc<dyn TransportConnector> = Arc::new(WsConnector::new(
            config.ws_url(),
            config.connection_timeout,
        ));
        Self::with_connector(config, connector)
    }

    /// Build a client over a caller-supplied transport (tests, custom
    /// transports).
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> GameClient {
        let bus = EventBus::new(EventBusConfig::default());
        let pipeline = Arc::new(SerializationPipeline::new(PipelineConfig {
            dialect: config.dialect,
            format: config.wire_format,
            validate: true,
            adapt: true,
        }));

        let connection_config = ConnectionConfig {
            connect_timeout: config.connection_timeout,
            reconnect: RetryConfig {
                max_attempts: config.reconnect_attempts.max(1),
                base_delay: config.reconnect_delay,
                ..RetryConfig::default()
            },
            ..ConnectionConfig::default()
        };
        let (connection, inbound_rx) =
            ConnectionManager::new(connector, connection_config, bus.clone());

        let subscriptions =
            SubscriptionEngine::new(connection.clone(), bus.clone(), pipeline.clone());
        let reducers = ReducerDispatcher::new(
            connection.clone(),
            bus.clone(),
            config.dialect,
            DispatcherConfig::default(),
        );
        let auth_flow = Arc::new(AuthFlow::new());
        let auth_breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            expected_groups: [ErrorGroup::Authentication, ErrorGroup::Transport]
                .into_iter()
                .collect(),
            ..BreakerConfig::default()
        }));

        let client = GameClient {
            config,
            bus: bus.clone(),
            connection,
            subscriptions: subscriptions.clone(),
            reducers: reducers.clone(),
            tokens: TokenManager::with_defaults(),
            auth_flow: auth_flow.clone(),
            auth_breaker,
            pipeline,
            router: Mutex::new(None),
            current_player: Mutex::new(None),
        };
        let router = tokio::spawn(route_inbound(
            inbound_rx,
            subscriptions,
            reducers,
            auth_flow,
            bus,
        ));
        *client.router.lock().unwrap() = Some(router);
        client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn reducer_dispatcher(&self) -> &ReducerDispatcher {
        &self.reducers
    }

    // -- lifecycle --

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Authenticate with the server using `identity`, storing the issued
    /// token. Gated by a circuit breaker: a storm of failures opens the
    /// circuit and subsequent attempts fail fast with `CircuitOpen`
    /// without contacting the server.
    pub async fn authenticate(&self, identity: &Identity) -> Result<AuthToken, ClientError> {
        let flow = self.auth_flow.clone();
        let connection = self.connection.clone();
        let timeout = self.config.connection_timeout;
        let token = self
            .auth_breaker
            .call("authenticate", || {
                let identity = identity.clone();
                async move { flow.authenticate(&connection, &identity, timeout).await }
            })
            .await?;
        self.tokens.store_token(token.clone());
        info!(identity_id = %identity.identity_id, "authenticated");
        Ok(token)
    }

    /// Ordered shutdown: leave the game, unsubscribe, cancel pending
    /// reducer calls, close the connection, stop the token manager, then
    /// drain and stop the event bus.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(2);
        if self.current_player.lock().unwrap().is_some() {
            let _ = self
                .reducers
                .call_safe("leave_game", json!({}), Some(grace))
                .await;
            *self.current_player.lock().unwrap() = None;
        }
        if let Err(e) = self.subscriptions.unsubscribe_all(grace).await {
            debug!(error = %e, "unsubscribe during shutdown failed");
        }
        self.reducers.cancel_all();
        self.connection.disconnect().await;
        if let Some(router) = self.router.lock().unwrap().take() {
            router.abort();
        }
        self.tokens.shutdown();
        self.bus.shutdown().await;
        info!("client shut down");
    }

    // -- subscriptions & cache --

    pub async fn subscribe(&self, tables: &[&str]) -> Result<(), ClientError> {
        self.subscriptions
            .subscribe(tables, self.config.connection_timeout)
            .await
    }

    pub async fn unsubscribe(&self, tables: &[&str]) -> Result<(), ClientError> {
        self.subscriptions
            .unsubscribe(tables, self.config.connection_timeout)
            .await
    }

    pub fn subscription_state(&self, table: &str) -> SubscriptionState {
        self.subscriptions.state(table)
    }

    pub fn get_all_players(&self) -> Vec<Player> {
        self.subscriptions.cache().players()
    }

    pub fn get_all_entities(&self) -> Vec<Entity> {
        self.subscriptions.cache().entities()
    }

    pub fn get_all_circles(&self) -> Vec<Circle> {
        self.subscriptions.cache().circles()
    }

    pub fn get_entities_near(&self, center: Vec2, radius: f64) -> Vec<Entity> {
        self.subscriptions.cache().entities_near(center, radius)
    }

    pub fn clear_table_cache(&self, table: Option<&str>) {
        self.subscriptions.clear_table_cache(table);
    }

    // -- reducers --

    pub async fn call_reducer(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<ReducerResult, ClientError> {
        self.reducers.call(reducer, args, timeout).await
    }

    pub async fn call_reducer_strict(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        self.reducers.call_strict(reducer, args, timeout).await
    }

    pub async fn call_reducer_safe(
        &self,
        reducer: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        self.reducers.call_safe(reducer, args, timeout).await
    }

    pub fn cancel_reducer(&self, request_id: &str) -> bool {
        self.reducers.cancel(request_id)
    }

    // -- game convenience wrappers --

    /// Join the game with a display name.
    pub async fn enter_game(&self, name: &str) -> Result<ReducerResult, ClientError> {
        let result = self
            .reducers
            .call("enter_game", json!({ "player_name": name }), None)
            .await?;
        if result.is_success() {
            *self.current_player.lock().unwrap() = Some(name.to_owned());
        }
        Ok(result)
    }

    /// Send a movement input; the direction is normalized before transmit.
    pub async fn update_player_input(
        &self,
        direction: Vec2,
    ) -> Result<ReducerResult, ClientError> {
        let d = direction.normalized();
        self.reducers
            .call(
                "update_player_input",
                json!({ "direction": { "x": d.x, "y": d.y } }),
                None,
            )
            .await
    }

    pub async fn player_split(&self) -> Result<ReducerResult, ClientError> {
        self.reducers.call("player_split", json!({}), None).await
    }

    pub async fn leave_game(&self) -> Option<Value> {
        let result = self.reducers.call_safe("leave_game", json!({}), None).await;
        *self.current_player.lock().unwrap() = None;
        result
    }

    // -- events --

    /// Register an event handler with a filter; returns an id usable with
    /// [`remove_event_handler`](Self::remove_event_handler).
    pub fn on_event(
        &self,
        name: &str,
        filter: EventFilter,
        handler: EventHandler,
    ) -> SubscriptionId {
        self.bus.subscribe(name, filter, handler)
    }

    pub fn remove_event_handler(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    // -- observability --

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connection_state: self.connection.state(),
            pipeline: self.pipeline.metrics(),
            events: self.bus.metrics(),
            reducers: self.reducers.stats(),
            auth_breaker: self.auth_breaker.snapshot(),
        }
    }
}

/// Inbound demultiplexer: every server message lands exactly one place.
async fn route_inbound(
    mut rx: mpsc::Receiver<ServerMessage>,
    subscriptions: SubscriptionEngine,
    reducers: ReducerDispatcher,
    auth_flow: Arc<AuthFlow>,
    bus: EventBus,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ServerMessage::SubscribeAck(ack) => subscriptions.handle_ack(ack),
            ServerMessage::InitialData(initial) => subscriptions.handle_initial_data(initial),
            ServerMessage::TableDelta(delta) => subscriptions.handle_delta(delta),
            ServerMessage::ReducerResponse(response) => reducers.handle_response(response),
            ServerMessage::AuthChallenge(_) | ServerMessage::AuthResult(_) => {
                auth_flow.deliver(msg);
            }
            // The connection manager already tracks heartbeat arrival.
            ServerMessage::Heartbeat(_) => {}
            ServerMessage::Error(err) => {
                warn!(code = %err.code, message = %err.message, "server error");
                bus.publish(Event::error_event(
                    "server",
                    &format!("{}: {}", err.code, err.message),
                ));
            }
        }
    }
    debug!("inbound router stopped");
}
