//! Event values and subscriber-side filters.
//!
//! Events are created by publishers, handed to the bus, then shared
//! read-only with subscribers; they are never mutated after publish.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

/// Closed set of event kinds.
///
/// Game-level specializations (player joined, entity created, ...) carry
/// their payload in [`Event::data`] and fit under one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    Authentication,
    Subscription,
    GameState,
    Player,
    Entity,
    Reducer,
    System,
    Error,
    Debug,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::Authentication => "authentication",
            EventKind::Subscription => "subscription",
            EventKind::GameState => "game_state",
            EventKind::Player => "player",
            EventKind::Entity => "entity",
            EventKind::Reducer => "reducer",
            EventKind::System => "system",
            EventKind::Error => "error",
            EventKind::Debug => "debug",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority classes. `High` and above go to the unbounded priority lane;
/// `Normal` and below to the bounded FIFO lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
    Emergency,
}

impl EventPriority {
    pub fn is_high_class(&self) -> bool {
        *self >= EventPriority::High
    }
}

/// A single event.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: String,
    /// Microseconds since the Unix epoch at creation time.
    pub timestamp_micros: i64,
    pub kind: EventKind,
    pub priority: EventPriority,
    pub source: String,
    pub correlation_id: Option<String>,
    pub data: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, priority: EventPriority, source: impl Into<String>) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp_micros: now_micros(),
            kind,
            priority,
            source: source.into(),
            correlation_id: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Event {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Event {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn age_micros(&self) -> i64 {
        now_micros() - self.timestamp_micros
    }

    // -- well-known events published by the client runtime --

    pub fn connection_state_changed(old: &str, new: &str) -> Event {
        Event::new(EventKind::Connection, EventPriority::High, "connection")
            .with_data("old_state", Value::from(old))
            .with_data("new_state", Value::from(new))
    }

    pub fn subscription_state_changed(table: &str, old: &str, new: &str) -> Event {
        Event::new(EventKind::Subscription, EventPriority::Normal, "subscription")
            .with_data("table", Value::from(table))
            .with_data("old_state", Value::from(old))
            .with_data("new_state", Value::from(new))
    }

    pub fn table_insert(table: &str, row: Value) -> Event {
        Event::new(EventKind::Entity, EventPriority::Normal, "subscription")
            .with_data("table", Value::from(table))
            .with_data("op", Value::from("insert"))
            .with_data("row", row)
    }

    pub fn table_update(table: &str, old_row: Value, new_row: Value) -> Event {
        Event::new(EventKind::Entity, EventPriority::Normal, "subscription")
            .with_data("table", Value::from(table))
            .with_data("op", Value::from("update"))
            .with_data("old_row", old_row)
            .with_data("row", new_row)
    }

    pub fn table_delete(table: &str, row: Value) -> Event {
        Event::new(EventKind::Entity, EventPriority::Normal, "subscription")
            .with_data("table", Value::from(table))
            .with_data("op", Value::from("delete"))
            .with_data("row", row)
    }

    pub fn initial_data_received(table: &str, row_count: usize) -> Event {
        Event::new(EventKind::Subscription, EventPriority::Normal, "subscription")
            .with_data("table", Value::from(table))
            .with_data("row_count", Value::from(row_count as u64))
    }

    pub fn player_joined(player_id: u64, name: &str) -> Event {
        Event::new(EventKind::Player, EventPriority::Normal, "game")
            .with_data("player_id", Value::from(player_id))
            .with_data("name", Value::from(name))
    }

    pub fn reducer_completed(reducer: &str, request_id: &str, success: bool) -> Event {
        Event::new(EventKind::Reducer, EventPriority::Normal, "reducer")
            .with_correlation(request_id)
            .with_data("reducer", Value::from(reducer))
            .with_data("success", Value::from(success))
    }

    pub fn error_event(source: &str, message: &str) -> Event {
        Event::new(EventKind::Error, EventPriority::High, source)
            .with_data("message", Value::from(message))
    }
}

pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Declarative match over events: kinds, a priority floor, sources, and an
/// optional predicate. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
    min_priority: Option<EventPriority>,
    sources: Option<HashSet<String>>,
    predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl EventFilter {
    /// Matches every event.
    pub fn any() -> EventFilter {
        EventFilter::default()
    }

    pub fn for_kinds(kinds: impl IntoIterator<Item = EventKind>) -> EventFilter {
        EventFilter {
            kinds: Some(kinds.into_iter().collect()),
            ..EventFilter::default()
        }
    }

    pub fn with_min_priority(mut self, priority: EventPriority) -> EventFilter {
        self.min_priority = Some(priority);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> EventFilter {
        self.sources
            .get_or_insert_with(HashSet::new)
            .insert(source.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> EventFilter
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if event.priority < min {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("kinds", &self.kinds)
            .field("min_priority", &self.min_priority)
            .field("sources", &self.sources)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_ordering() {
        assert!(EventPriority::Emergency > EventPriority::Critical);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::High.is_high_class());
        assert!(!EventPriority::Normal.is_high_class());
    }

    #[test]
    fn events_get_unique_ids() {
        let a = Event::new(EventKind::System, EventPriority::Normal, "test");
        let b = Event::new(EventKind::System, EventPriority::Normal, "test");
        assert_ne!(a.event_id, b.event_id);
        assert!(a.timestamp_micros > 0);
    }

    #[test]
    fn filter_by_kind_and_priority() {
        let filter = EventFilter::for_kinds([EventKind::Player, EventKind::Entity])
            .with_min_priority(EventPriority::Normal);
        let hit = Event::new(EventKind::Player, EventPriority::High, "game");
        let wrong_kind = Event::new(EventKind::Debug, EventPriority::High, "game");
        let too_low = Event::new(EventKind::Player, EventPriority::Low, "game");
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_kind));
        assert!(!filter.matches(&too_low));
    }

    #[test]
    fn filter_predicate_applies_last() {
        let filter = EventFilter::any()
            .with_predicate(|e| e.data.get("table").and_then(|v| v.as_str()) == Some("player"));
        let hit = Event::table_insert("player", json!({}));
        let miss = Event::table_insert("entity", json!({}));
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }

    #[test]
    fn filter_by_source() {
        let filter = EventFilter::any().with_source("connection");
        assert!(filter.matches(&Event::connection_state_changed("connecting", "connected")));
        assert!(!filter.matches(&Event::player_joined(1, "P1")));
    }

    #[test]
    fn well_known_constructors_fill_data() {
        let ev = Event::table_update("entity", json!({"mass": 1.0}), json!({"mass": 2.0}));
        assert_eq!(ev.kind, EventKind::Entity);
        assert_eq!(ev.data["op"], "update");
        assert_eq!(ev.data["row"]["mass"], 2.0);
        let ev = Event::reducer_completed("enter_game", "r-1", true);
        assert_eq!(ev.correlation_id.as_deref(), Some("r-1"));
    }
}
