//! Subscription engine: per-table state machines, delta routing and the
//! row cache.
//!
//! `subscribe`/`unsubscribe` suspend until the server acknowledges.
//! Inbound snapshot and delta messages are routed here by the client
//! facade; each is adapted and validated through the serialization
//! pipeline before touching the cache, and every cache change emits a
//! corresponding event on the bus.
//!
//! An empty initial snapshot is a normal outcome: the table still
//! transitions to Active and later deltas populate the cache without any
//! re-subscription.

pub mod cache;

pub use cache::TableCache;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use sd_core::TableRow;
use sd_protocol::{
    schema, ClientMessage, DeltaOp, InitialData, SerializationPipeline, Subscribe, SubscribeAck,
    TableDelta, Unsubscribe,
};

use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::events::{Event, EventBus};

/// Per-table subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Inactive,
    Subscribing,
    Active,
    Unsubscribing,
    Failed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Inactive => "inactive",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Active => "active",
            SubscriptionState::Unsubscribing => "unsubscribing",
            SubscriptionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOp {
    Subscribe,
    Unsubscribe,
}

struct AckWaiter {
    op: AckOp,
    remaining: HashSet<String>,
    first_failure: Option<ClientError>,
    tx: Option<oneshot::Sender<Result<(), ClientError>>>,
}

struct SubInner {
    connection: ConnectionManager,
    bus: EventBus,
    pipeline: Arc<SerializationPipeline>,
    cache: Arc<TableCache>,
    states: Mutex<HashMap<String, SubscriptionState>>,
    waiters: Mutex<HashMap<String, AckWaiter>>,
}

#[derive(Clone)]
pub struct SubscriptionEngine {
    inner: Arc<SubInner>,
}

impl SubscriptionEngine {
    pub fn new(
        connection: ConnectionManager,
        bus: EventBus,
        pipeline: Arc<SerializationPipeline>,
    ) -> SubscriptionEngine {
        SubscriptionEngine {
            inner: Arc::new(SubInner {
                connection,
                bus,
                pipeline,
                cache: Arc::new(TableCache::new()),
                states: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.inner.cache
    }

    pub fn state(&self, table: &str) -> SubscriptionState {
        self.inner
            .states
            .lock()
            .unwrap()
            .get(table)
            .copied()
            .unwrap_or(SubscriptionState::Inactive)
    }

    /// Tables currently subscribed (or in flight).
    pub fn subscribed_tables(&self) -> Vec<String> {
        let states = self.inner.states.lock().unwrap();
        let mut out: Vec<String> = states
            .iter()
            .filter(|(_, s)| {
                matches!(s, SubscriptionState::Active | SubscriptionState::Subscribing)
            })
            .map(|(t, _)| t.clone())
            .collect();
        out.sort();
        out
    }

    /// Subscribe to tables; suspends until every table is acknowledged.
    pub async fn subscribe(&self, tables: &[&str], timeout: Duration) -> Result<(), ClientError> {
        self.request(AckOp::Subscribe, tables, timeout).await
    }

    /// Unsubscribe from tables; suspends until acknowledged. Cached rows
    /// are left in place.
    pub async fn unsubscribe(&self, tables: &[&str], timeout: Duration) -> Result<(), ClientError> {
        self.request(AckOp::Unsubscribe, tables, timeout).await
    }

    pub async fn unsubscribe_all(&self, timeout: Duration) -> Result<(), ClientError> {
        let tables = self.subscribed_tables();
        if tables.is_empty() {
            return Ok(());
        }
        let refs: Vec<&str> = tables.iter().map(String::as_str).collect();
        self.unsubscribe(&refs, timeout).await
    }

    pub fn clear_table_cache(&self, table: Option<&str>) {
        self.inner.cache.clear(table);
    }

    async fn request(
        &self,
        op: AckOp,
        tables: &[&str],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if tables.is_empty() {
            return Ok(());
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let pending_state = match op {
            AckOp::Subscribe => SubscriptionState::Subscribing,
            AckOp::Unsubscribe => SubscriptionState::Unsubscribing,
        };
        for table in tables {
            self.set_state(table, pending_state);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().unwrap().insert(
            request_id.clone(),
            AckWaiter {
                op,
                remaining: tables.iter().map(|t| (*t).to_owned()).collect(),
                first_failure: None,
                tx: Some(tx),
            },
        );

        let table_names: Vec<String> = tables.iter().map(|t| (*t).to_owned()).collect();
        let msg = match op {
            AckOp::Subscribe => ClientMessage::Subscribe(Subscribe {
                request_id: request_id.clone(),
                tables: table_names,
            }),
            AckOp::Unsubscribe => ClientMessage::Unsubscribe(Unsubscribe {
                request_id: request_id.clone(),
                tables: table_names,
            }),
        };
        if let Err(e) = self.inner.connection.send(msg, Some(timeout)).await {
            self.inner.waiters.lock().unwrap().remove(&request_id);
            for table in tables {
                self.set_state(table, SubscriptionState::Failed);
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled("subscription engine dropped".into())),
            Err(_) => {
                // Ack never arrived; mark whatever is still outstanding.
                if let Some(waiter) = self.inner.waiters.lock().unwrap().remove(&request_id) {
                    for table in &waiter.remaining {
                        self.set_state(table, SubscriptionState::Failed);
                    }
                }
                Err(ClientError::DeadlineExceeded(format!(
                    "{:?} ack not received within {:?}",
                    op, timeout
                )))
            }
        }
    }

    /// Route one inbound message. Called by the client facade for
    /// `SubscribeAck`, `InitialData` and `TableDelta` messages.
    pub fn handle_ack(&self, ack: SubscribeAck) {
        let mut waiters = self.inner.waiters.lock().unwrap();
        let waiter = match waiters.get_mut(&ack.request_id) {
            Some(waiter) => waiter,
            None => {
                debug!(request_id = %ack.request_id, "ack for unknown request");
                return;
            }
        };
        waiter.remaining.remove(&ack.table);
        if ack.ok {
            match waiter.op {
                // Subscribing holds until the initial snapshot lands.
                AckOp::Subscribe => {}
                AckOp::Unsubscribe => self.set_state(&ack.table, SubscriptionState::Inactive),
            }
        } else {
            let reason = ack.error.unwrap_or_else(|| "subscription rejected".to_owned());
            self.set_state(&ack.table, SubscriptionState::Failed);
            if waiter.first_failure.is_none() {
                waiter.first_failure = Some(ClientError::GameState(format!(
                    "table '{}': {}",
                    ack.table, reason
                )));
            }
        }
        if waiter.remaining.is_empty() {
            let mut waiter = waiters.remove(&ack.request_id).expect("waiter present");
            if let Some(tx) = waiter.tx.take() {
                let outcome = match waiter.first_failure.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                let _ = tx.send(outcome);
            }
        }
    }

    /// Apply an initial snapshot: bulk insert with per-row inserts
    /// suppressed, then a single `InitialDataReceived` event. An empty
    /// snapshot still activates the table.
    pub fn handle_initial_data(&self, initial: InitialData) {
        let table = initial.table.clone();
        let mut keyed = Vec::with_capacity(initial.rows.len());
        for row in &initial.rows {
            match self.adapt_and_key(&table, row) {
                Some(entry) => keyed.push(entry),
                None => continue,
            }
        }
        let row_count = keyed.len();
        self.inner.cache.replace_table(&table, keyed);
        self.set_state(&table, SubscriptionState::Active);
        self.inner
            .bus
            .publish(Event::initial_data_received(&table, row_count));
        debug!(table = %table, rows = row_count, "initial snapshot applied");
    }

    /// Apply one delta in arrival order and emit the matching event.
    pub fn handle_delta(&self, delta: TableDelta) {
        let table = delta.table.clone();
        let (key, row) = match self.adapt_and_key(&table, &delta.row) {
            Some(entry) => entry,
            None => return,
        };
        match delta.op {
            DeltaOp::Insert => {
                self.check_owner_invariant(&table, &row);
                match self.inner.cache.upsert(&table, key, row.clone()) {
                    // Duplicate-key insert is an update.
                    Some(old) => self.publish_update(&table, &old, &row),
                    None => {
                        self.inner.bus.publish(Event::table_insert(
                            &table,
                            serde_json::to_value(&row).unwrap_or_default(),
                        ));
                    }
                }
            }
            DeltaOp::Update => {
                let old = self.inner.cache.upsert(&table, key, row.clone());
                let old = match (old, &delta.old_row) {
                    (Some(cached), _) => cached,
                    (None, Some(provided)) => {
                        match self.inner.pipeline.adapt_inbound(&table, provided) {
                            Ok(adapted) => adapted,
                            Err(_) => TableRow::new(),
                        }
                    }
                    (None, None) => TableRow::new(),
                };
                self.publish_update(&table, &old, &row);
            }
            DeltaOp::Delete => match self.inner.cache.remove(&table, &key) {
                Some(old) => {
                    self.inner.bus.publish(Event::table_delete(
                        &table,
                        serde_json::to_value(&old).unwrap_or_default(),
                    ));
                }
                None => debug!(table = %table, key, "delete for unknown row"),
            },
        }
    }

    // -- internal --

    fn publish_update(&self, table: &str, old: &TableRow, new: &TableRow) {
        self.inner.bus.publish(Event::table_update(
            table,
            serde_json::to_value(old).unwrap_or_default(),
            serde_json::to_value(new).unwrap_or_default(),
        ));
    }

    fn adapt_and_key(&self, table: &str, row: &TableRow) -> Option<(String, TableRow)> {
        let adapted = match self.inner.pipeline.adapt_inbound(table, row) {
            Ok(adapted) => adapted,
            Err(e) => {
                warn!(table, error = %e, "dropping undecodable row");
                return None;
            }
        };
        let pk = schema::schema_for(table)
            .map(|s| s.primary_key)
            .unwrap_or("entity_id");
        let key = match adapted.get(pk) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                warn!(table, pk, "row missing primary key, dropping");
                return None;
            }
        };
        Some((key, adapted))
    }

    /// Owner binding check at insert time: violations are logged, the row
    /// is cached regardless.
    fn check_owner_invariant(&self, table: &str, row: &TableRow) {
        if table != "entity" {
            return;
        }
        let owner = match row.get("owner_id").and_then(|v| v.as_u64()) {
            Some(owner) => owner,
            None => return,
        };
        if !self.inner.cache.contains("player", &owner.to_string()) {
            warn!(
                owner_id = owner,
                row_id = %row.describe_id(),
                "entity owner does not match any cached player"
            );
        }
    }

    fn set_state(&self, table: &str, new: SubscriptionState) {
        let old = {
            let mut states = self.inner.states.lock().unwrap();
            states.insert(table.to_owned(), new)
        }
        .unwrap_or(SubscriptionState::Inactive);
        if old != new {
            self.inner.bus.publish(Event::subscription_state_changed(
                table,
                old.as_str(),
                new.as_str(),
            ));
        }
    }
}
