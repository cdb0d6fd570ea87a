//! Composable event-processing utilities: throttling, batching,
//! deduplication, aggregation and routing.
//!
//! These are plain value types driven by the caller (typically from a
//! subscriber or middleware); wrap one in a mutex to share it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::error;

use crate::events::event::{Event, EventFilter, EventKind, EventPriority};

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// What to do with the excess when the rate cap is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Evict the oldest slot and admit the new event.
    Oldest,
    /// Reject the new event.
    Newest,
    /// Admit high-class events by evicting the oldest; reject the rest.
    Priority,
}

/// Queueing rate limiter: at most `rate` events emit per sliding window.
///
/// Incoming events wait in a bounded pending queue (capacity equals the
/// per-window budget); on overflow the drop policy picks the victim.
/// `take_ready` hands back the events allowed to emit right now.
#[derive(Debug)]
pub struct EventThrottle {
    window: Duration,
    budget: usize,
    policy: DropPolicy,
    pending: VecDeque<Arc<Event>>,
    emitted: VecDeque<Instant>,
    dropped: u64,
}

impl EventThrottle {
    pub fn new(max_events_per_second: f64, policy: DropPolicy) -> EventThrottle {
        let window = Duration::from_secs(1);
        EventThrottle {
            window,
            budget: (max_events_per_second * window.as_secs_f64()).max(0.0) as usize,
            policy,
            pending: VecDeque::new(),
            emitted: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Queue an event for emission. Returns false when this event was
    /// dropped; with the `Oldest` policy the new event is queued and the
    /// oldest pending one is dropped instead.
    pub fn submit(&mut self, event: Arc<Event>) -> bool {
        if self.pending.len() < self.budget {
            self.pending.push_back(event);
            return true;
        }
        match self.policy {
            DropPolicy::Newest => {
                self.dropped += 1;
                false
            }
            DropPolicy::Oldest => {
                self.pending.pop_front();
                self.dropped += 1;
                self.pending.push_back(event);
                true
            }
            DropPolicy::Priority => {
                if event.priority.is_high_class() {
                    self.pending.pop_front();
                    self.dropped += 1;
                    self.pending.push_back(event);
                    true
                } else {
                    self.dropped += 1;
                    false
                }
            }
        }
    }

    /// Pop every queued event the current window's budget allows.
    pub fn take_ready(&mut self) -> Vec<Arc<Event>> {
        let now = Instant::now();
        while self
            .emitted
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            self.emitted.pop_front();
        }
        let mut out = Vec::new();
        while self.emitted.len() < self.budget {
            match self.pending.pop_front() {
                Some(event) => {
                    self.emitted.push_back(now);
                    out.push(event);
                }
                None => break,
            }
        }
        out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.emitted.clear();
        self.dropped = 0;
    }
}

// ---------------------------------------------------------------------------
// Batcher
// ---------------------------------------------------------------------------

pub type BatchKeyFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Groups events by key; a batch completes on size or age.
pub struct EventBatcher {
    max_size: usize,
    max_age: Duration,
    key_fn: BatchKeyFn,
    batches: HashMap<String, Vec<Arc<Event>>>,
    started: HashMap<String, Instant>,
    total_batches: u64,
}

impl EventBatcher {
    pub fn new(max_size: usize, max_age: Duration) -> EventBatcher {
        Self::with_key_fn(max_size, max_age, Arc::new(|_| "default".to_owned()))
    }

    pub fn with_key_fn(max_size: usize, max_age: Duration, key_fn: BatchKeyFn) -> EventBatcher {
        EventBatcher {
            max_size,
            max_age,
            key_fn,
            batches: HashMap::new(),
            started: HashMap::new(),
            total_batches: 0,
        }
    }

    /// Add an event; returns the completed batch when size or age tripped.
    pub fn add(&mut self, event: Arc<Event>) -> Option<Vec<Arc<Event>>> {
        let key = (self.key_fn)(&event);
        let batch = self.batches.entry(key.clone()).or_default();
        batch.push(event);
        let started = *self.started.entry(key.clone()).or_insert_with(Instant::now);
        if batch.len() >= self.max_size || started.elapsed() >= self.max_age {
            self.started.remove(&key);
            self.total_batches += 1;
            return self.batches.remove(&key);
        }
        None
    }

    /// All batches whose age has expired, keyed by batch key.
    pub fn ready(&mut self) -> HashMap<String, Vec<Arc<Event>>> {
        let mut out = HashMap::new();
        let expired: Vec<String> = self
            .started
            .iter()
            .filter(|(_, started)| started.elapsed() >= self.max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(batch) = self.batches.remove(&key) {
                if !batch.is_empty() {
                    self.total_batches += 1;
                    out.insert(key.clone(), batch);
                }
            }
            self.started.remove(&key);
        }
        out
    }

    /// Flush everything regardless of size or age.
    pub fn flush_all(&mut self) -> HashMap<String, Vec<Arc<Event>>> {
        self.started.clear();
        let drained: HashMap<String, Vec<Arc<Event>>> = self
            .batches
            .drain()
            .filter(|(_, batch)| !batch.is_empty())
            .collect();
        self.total_batches += drained.len() as u64;
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn total_batches(&self) -> u64 {
        self.total_batches
    }
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

pub type DedupKeyFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Drops events whose key was seen within the window.
pub struct EventDeduplicator {
    window: Duration,
    key_fn: DedupKeyFn,
    seen: HashMap<String, Instant>,
    duplicates: u64,
}

impl EventDeduplicator {
    pub fn new(window: Duration) -> EventDeduplicator {
        Self::with_key_fn(window, Arc::new(|e: &Event| e.event_id.clone()))
    }

    pub fn with_key_fn(window: Duration, key_fn: DedupKeyFn) -> EventDeduplicator {
        EventDeduplicator {
            window,
            key_fn,
            seen: HashMap::new(),
            duplicates: 0,
        }
    }

    pub fn is_duplicate(&mut self, event: &Event) -> bool {
        let now = Instant::now();
        self.seen.retain(|_, t| now.duration_since(*t) < self.window);
        let key = (self.key_fn)(event);
        if self.seen.contains_key(&key) {
            self.duplicates += 1;
            true
        } else {
            self.seen.insert(key, now);
            false
        }
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.duplicates = 0;
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub type AggregateKeyFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Combines events sharing a key within a window into one summary event.
pub struct EventAggregator {
    window: Duration,
    key_fn: AggregateKeyFn,
    groups: HashMap<String, Vec<Arc<Event>>>,
    started: HashMap<String, Instant>,
    aggregated: u64,
}

impl EventAggregator {
    pub fn new(window: Duration) -> EventAggregator {
        Self::with_key_fn(
            window,
            Arc::new(|e: &Event| format!("{}_{}", e.kind, e.source)),
        )
    }

    pub fn with_key_fn(window: Duration, key_fn: AggregateKeyFn) -> EventAggregator {
        EventAggregator {
            window,
            key_fn,
            groups: HashMap::new(),
            started: HashMap::new(),
            aggregated: 0,
        }
    }

    /// Add an event; returns the summary when this key's window is complete.
    pub fn add(&mut self, event: Arc<Event>) -> Option<Event> {
        let key = (self.key_fn)(&event);
        self.groups.entry(key.clone()).or_default().push(event);
        let started = *self.started.entry(key.clone()).or_insert_with(Instant::now);
        if started.elapsed() >= self.window {
            self.started.remove(&key);
            let group = self.groups.remove(&key)?;
            self.aggregated += 1;
            return Some(summarize(&group));
        }
        None
    }

    /// Flush every group regardless of window completion.
    pub fn flush_all(&mut self) -> Vec<Event> {
        self.started.clear();
        let out: Vec<Event> = self
            .groups
            .drain()
            .filter(|(_, g)| !g.is_empty())
            .map(|(_, g)| summarize(&g))
            .collect();
        self.aggregated += out.len() as u64;
        out
    }

    pub fn aggregated_count(&self) -> u64 {
        self.aggregated
    }
}

fn summarize(events: &[Arc<Event>]) -> Event {
    let base = events.last().expect("summarize of empty group");
    let max_priority = events
        .iter()
        .map(|e| e.priority)
        .max()
        .unwrap_or(EventPriority::Normal);
    let span = events.last().unwrap().timestamp_micros - events.first().unwrap().timestamp_micros;
    let mut kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    Event::new(base.kind, max_priority, format!("aggregated:{}", base.source))
        .with_data("event_count", Value::from(events.len() as u64))
        .with_data("time_span_micros", Value::from(span))
        .with_data(
            "kinds",
            Value::from(kinds.into_iter().map(Value::from).collect::<Vec<_>>()),
        )
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub type RouteSink = Arc<dyn Fn(&Arc<Event>) + Send + Sync>;

/// Conditional fan-out: each matching route's sinks run; unmatched events
/// fall through to the default sinks.
#[derive(Default)]
pub struct EventRouter {
    routes: Vec<(EventFilter, Vec<RouteSink>)>,
    default_sinks: Vec<RouteSink>,
    routed: u64,
    unrouted: u64,
}

impl EventRouter {
    pub fn new() -> EventRouter {
        EventRouter::default()
    }

    pub fn add_route(&mut self, condition: EventFilter, sinks: Vec<RouteSink>) {
        self.routes.push((condition, sinks));
    }

    pub fn add_default_sink(&mut self, sink: RouteSink) {
        self.default_sinks.push(sink);
    }

    /// Route one event; returns whether any sink ran. Sink panics are
    /// contained so one bad route cannot starve the rest.
    pub fn route(&mut self, event: &Arc<Event>) -> bool {
        let mut routed = false;
        for (condition, sinks) in &self.routes {
            if condition.matches(event) {
                for sink in sinks {
                    run_sink(sink, event);
                    routed = true;
                }
            }
        }
        if !routed {
            for sink in &self.default_sinks {
                run_sink(sink, event);
                routed = true;
            }
        }
        if routed {
            self.routed += 1;
        } else {
            self.unrouted += 1;
        }
        routed
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.routed, self.unrouted)
    }
}

fn run_sink(sink: &RouteSink, event: &Arc<Event>) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(event)));
    if result.is_err() {
        error!(event_id = %event.event_id, "route sink panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ev(priority: EventPriority) -> Event {
        Event::new(EventKind::GameState, priority, "test")
    }

    #[test]
    fn throttle_emits_exactly_the_window_budget() {
        // 100 events submitted in a burst against a 20/s throttle with the
        // oldest-drop policy: exactly 20 emit in the first window and the
        // dropped counter reads 80.
        let mut t = EventThrottle::new(20.0, DropPolicy::Oldest);
        for i in 0..100u64 {
            t.submit(Arc::new(
                Event::new(EventKind::GameState, EventPriority::Low, "burst")
                    .with_data("seq", Value::from(i)),
            ));
        }
        let emitted = t.take_ready();
        assert_eq!(emitted.len(), 20);
        assert_eq!(t.dropped_count(), 80);
        // Oldest policy keeps the most recent events.
        assert_eq!(emitted[0].data["seq"], 80);
        assert_eq!(emitted[19].data["seq"], 99);
        // Budget exhausted for this window.
        assert!(t.take_ready().is_empty());
    }

    #[test]
    fn throttle_newest_policy_keeps_the_earliest_events() {
        let mut t = EventThrottle::new(20.0, DropPolicy::Newest);
        for i in 0..100u64 {
            let accepted = t.submit(Arc::new(
                Event::new(EventKind::GameState, EventPriority::Low, "burst")
                    .with_data("seq", Value::from(i)),
            ));
            assert_eq!(accepted, i < 20);
        }
        let emitted = t.take_ready();
        assert_eq!(emitted.len(), 20);
        assert_eq!(emitted[0].data["seq"], 0);
        assert_eq!(t.dropped_count(), 80);
    }

    #[test]
    fn throttle_priority_policy_favors_high_class() {
        let mut t = EventThrottle::new(2.0, DropPolicy::Priority);
        assert!(t.submit(Arc::new(ev(EventPriority::Low))));
        assert!(t.submit(Arc::new(ev(EventPriority::Low))));
        assert!(!t.submit(Arc::new(ev(EventPriority::Low))));
        assert!(t.submit(Arc::new(ev(EventPriority::Critical))));
        let emitted = t.take_ready();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].priority, EventPriority::Critical);
    }

    #[test]
    fn batcher_flushes_on_size() {
        let mut b = EventBatcher::new(3, Duration::from_secs(60));
        assert!(b.add(Arc::new(ev(EventPriority::Normal))).is_none());
        assert!(b.add(Arc::new(ev(EventPriority::Normal))).is_none());
        let batch = b.add(Arc::new(ev(EventPriority::Normal))).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.total_batches(), 1);
    }

    #[test]
    fn batcher_groups_by_key() {
        let mut b = EventBatcher::with_key_fn(
            2,
            Duration::from_secs(60),
            Arc::new(|e: &Event| e.source.clone()),
        );
        let a1 = Arc::new(Event::new(EventKind::Player, EventPriority::Normal, "a"));
        let b1 = Arc::new(Event::new(EventKind::Player, EventPriority::Normal, "b"));
        let a2 = Arc::new(Event::new(EventKind::Player, EventPriority::Normal, "a"));
        assert!(b.add(a1).is_none());
        assert!(b.add(b1).is_none());
        let batch = b.add(a2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.source == "a"));
        assert_eq!(b.pending_count(), 1);
    }

    #[test]
    fn batcher_flush_all_returns_partials() {
        let mut b = EventBatcher::new(100, Duration::from_secs(60));
        b.add(Arc::new(ev(EventPriority::Normal)));
        b.add(Arc::new(ev(EventPriority::Normal)));
        let flushed = b.flush_all();
        assert_eq!(flushed["default"].len(), 2);
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn dedup_drops_repeat_keys_within_window() {
        let mut d = EventDeduplicator::with_key_fn(
            Duration::from_secs(60),
            Arc::new(|e: &Event| e.source.clone()),
        );
        let first = ev(EventPriority::Normal);
        let second = ev(EventPriority::Normal);
        assert!(!d.is_duplicate(&first));
        assert!(d.is_duplicate(&second));
        assert_eq!(d.duplicate_count(), 1);
    }

    #[test]
    fn dedup_default_key_is_event_id() {
        let mut d = EventDeduplicator::new(Duration::from_secs(60));
        let event = ev(EventPriority::Normal);
        assert!(!d.is_duplicate(&event));
        assert!(d.is_duplicate(&event));
        assert!(!d.is_duplicate(&ev(EventPriority::Normal)));
    }

    #[test]
    fn aggregator_flush_all_summarizes() {
        let mut a = EventAggregator::new(Duration::from_secs(60));
        a.add(Arc::new(ev(EventPriority::Normal)));
        a.add(Arc::new(ev(EventPriority::Critical)));
        a.add(Arc::new(ev(EventPriority::Low)));
        let summaries = a.flush_all();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.priority, EventPriority::Critical);
        assert_eq!(summary.data["event_count"], 3);
        assert!(summary.source.starts_with("aggregated:"));
        assert_eq!(a.aggregated_count(), 1);
    }

    #[test]
    fn router_fans_out_and_falls_back() {
        let mut r = EventRouter::new();
        let player_hits = Arc::new(AtomicUsize::new(0));
        let default_hits = Arc::new(AtomicUsize::new(0));
        let p = player_hits.clone();
        r.add_route(
            EventFilter::for_kinds([EventKind::Player]),
            vec![Arc::new(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            })],
        );
        let d = default_hits.clone();
        r.add_default_sink(Arc::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let player = Arc::new(Event::new(EventKind::Player, EventPriority::Normal, "g"));
        let system = Arc::new(Event::new(EventKind::System, EventPriority::Normal, "g"));
        assert!(r.route(&player));
        assert!(r.route(&system));
        assert_eq!(player_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 1);
        assert_eq!(r.counts(), (2, 0));
    }

    #[test]
    fn router_contains_sink_panics() {
        let mut r = EventRouter::new();
        let after = Arc::new(Mutex::new(false));
        r.add_route(
            EventFilter::any(),
            vec![Arc::new(|_| panic!("bad sink"))],
        );
        let a = after.clone();
        r.add_route(
            EventFilter::any(),
            vec![Arc::new(move |_| {
                *a.lock().unwrap() = true;
            })],
        );
        let event = Arc::new(ev(EventPriority::Normal));
        assert!(r.route(&event));
        assert!(*after.lock().unwrap());
    }
}
