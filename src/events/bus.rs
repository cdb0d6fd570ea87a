//! The event bus.
//!
//! Two lanes: a bounded FIFO queue for `Normal` and below and an unbounded
//! deque for `High` and above. The dispatcher loop drains the priority
//! lane first, then takes one FIFO item, then loops; ordering is FIFO
//! within each lane with no guarantee between lanes.
//!
//! Each subscriber has its own channel and worker task, so delivery is
//! concurrent across subscribers but strictly in-order per subscriber.
//! Sync handlers run on a bounded `spawn_blocking` pool gated by a
//! semaphore so they never stall the dispatcher or the async workers.
//!
//! Publishers never observe subscriber failures: handler panics are
//! caught, logged and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::event::{Event, EventFilter};
use crate::events::metrics::{EventMetrics, EventMetricsSnapshot};

pub type AsyncHandlerFn = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type SyncHandlerFn = Arc<dyn Fn(Arc<Event>) + Send + Sync>;
pub type MiddlewareFn = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;
pub type GlobalFilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// How a subscriber consumes events.
#[derive(Clone)]
pub enum EventHandler {
    Async(AsyncHandlerFn),
    Sync(SyncHandlerFn),
}

impl EventHandler {
    /// Convenience constructor for async closures.
    pub fn from_async<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        EventHandler::Async(Arc::new(move |ev| f(ev).boxed()))
    }

    /// Convenience constructor for sync (possibly blocking) closures.
    pub fn from_sync<F>(f: F) -> EventHandler
    where
        F: Fn(Arc<Event>) + Send + Sync + 'static,
    {
        EventHandler::Sync(Arc::new(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the Normal-and-below FIFO lane; overflow drops the
    /// incoming event and bumps the dropped counter.
    pub fifo_capacity: usize,
    /// Concurrent sync handlers allowed on the blocking pool.
    pub sync_workers: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig {
            fifo_capacity: 1024,
            sync_workers: 4,
        }
    }
}

struct Subscriber {
    id: u64,
    name: String,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Arc<Event>>,
    worker: JoinHandle<()>,
}

struct BusInner {
    config: EventBusConfig,
    fifo: Mutex<VecDeque<Arc<Event>>>,
    priority: Mutex<VecDeque<Arc<Event>>>,
    notify: Arc<Notify>,
    subscribers: Mutex<Vec<Subscriber>>,
    middleware: Mutex<Vec<MiddlewareFn>>,
    filters: Mutex<Vec<GlobalFilterFn>>,
    metrics: EventMetrics,
    sync_pool: Arc<Semaphore>,
    /// Events handed to subscriber channels but not yet handled.
    inflight: AtomicUsize,
    next_subscriber_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the bus; cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> EventBus {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync_workers = config.sync_workers.max(1);
        let inner = Arc::new(BusInner {
            config,
            fifo: Mutex::new(VecDeque::new()),
            priority: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
            subscribers: Mutex::new(Vec::new()),
            middleware: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            metrics: EventMetrics::default(),
            sync_pool: Arc::new(Semaphore::new(sync_workers)),
            inflight: AtomicUsize::new(0),
            next_subscriber_id: AtomicU64::new(1),
            shutdown_tx,
            dispatcher: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), shutdown_rx));
        *inner.dispatcher.lock().unwrap() = Some(dispatcher);
        EventBus { inner }
    }

    /// Publish an event. Returns true if the event was enqueued, false if
    /// middleware dropped it, a global filter rejected it, or the FIFO
    /// lane was full.
    pub fn publish(&self, event: Event) -> bool {
        let mut event = event;
        for mw in self.inner.middleware.lock().unwrap().iter() {
            match mw(event) {
                Some(transformed) => event = transformed,
                None => {
                    debug!("event dropped by middleware");
                    self.inner.metrics.record_dropped();
                    return false;
                }
            }
        }
        for filter in self.inner.filters.lock().unwrap().iter() {
            if !filter(&event) {
                self.inner.metrics.record_dropped();
                return false;
            }
        }

        let kind = event.kind;
        let shared = Arc::new(event);
        if shared.priority.is_high_class() {
            self.inner.priority.lock().unwrap().push_back(shared);
        } else {
            let mut fifo = self.inner.fifo.lock().unwrap();
            if fifo.len() >= self.inner.config.fifo_capacity {
                warn!(capacity = self.inner.config.fifo_capacity, "event queue full, dropping");
                self.inner.metrics.record_dropped();
                return false;
            }
            fifo.push_back(shared);
        }
        self.inner.metrics.record_published(kind);
        self.inner.notify.notify_one();
        true
    }

    /// Register a middleware transformation; applies to every event in
    /// publish order. Returning `None` drops the event.
    pub fn add_middleware(&self, middleware: MiddlewareFn) {
        self.inner.middleware.lock().unwrap().push(middleware);
    }

    /// Register a global filter; runs after middleware.
    pub fn add_filter(&self, filter: GlobalFilterFn) {
        self.inner.filters.lock().unwrap().push(filter);
    }

    /// Register a subscriber with a filter and handler.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(subscriber_loop(
            Arc::downgrade(&self.inner),
            name.clone(),
            rx,
            handler,
        ));
        self.inner.subscribers.lock().unwrap().push(Subscriber {
            id,
            name,
            filter,
            tx,
            worker,
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id.0);
        subscribers.len() < before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    pub fn metrics(&self) -> EventMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.metrics.dropped()
    }

    /// Wait until both lanes are empty and every delivered event has been
    /// handled.
    pub async fn wait_until_idle(&self) {
        loop {
            let queued = {
                self.inner.fifo.lock().unwrap().len() + self.inner.priority.lock().unwrap().len()
            };
            if queued == 0 && self.inner.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Drain both lanes, stop the dispatcher, and wait for subscriber
    /// workers to finish their backlogs.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notify.notify_one();
        let dispatcher = self.inner.dispatcher.lock().unwrap().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        let subscribers: Vec<Subscriber> =
            std::mem::take(&mut *self.inner.subscribers.lock().unwrap());
        for sub in subscribers {
            drop(sub.tx);
            let _ = sub.worker.await;
        }
    }
}

/// Dispatcher: priority lane drains fully, then one FIFO item per cycle.
async fn dispatch_loop(bus: Weak<BusInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let inner = match bus.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let notify = inner.notify.clone();

        // Priority lane first, exhaustively.
        loop {
            let next = inner.priority.lock().unwrap().pop_front();
            match next {
                Some(event) => deliver(&inner, event),
                None => break,
            }
        }
        // One FIFO item per cycle so high-class events stay responsive.
        let fifo_item = inner.fifo.lock().unwrap().pop_front();
        if let Some(event) = fifo_item {
            deliver(&inner, event);
            continue;
        }

        let lanes_empty = inner.priority.lock().unwrap().is_empty()
            && inner.fifo.lock().unwrap().is_empty();
        if *shutdown.borrow() && lanes_empty {
            return;
        }
        drop(inner);
        tokio::select! {
            _ = notify.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn deliver(inner: &Arc<BusInner>, event: Arc<Event>) {
    let subscribers = inner.subscribers.lock().unwrap();
    for sub in subscribers.iter() {
        if !sub.filter.matches(&event) {
            continue;
        }
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        if sub.tx.send(event.clone()).is_err() {
            inner.inflight.fetch_sub(1, Ordering::AcqRel);
            debug!(subscriber = %sub.name, "subscriber channel closed");
        }
    }
}

/// Per-subscriber worker: in-order handling, panics contained.
async fn subscriber_loop(
    bus: Weak<BusInner>,
    name: String,
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    handler: EventHandler,
) {
    while let Some(event) = rx.recv().await {
        let inner = match bus.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let start = Instant::now();
        let outcome: Result<(), String> = match &handler {
            EventHandler::Async(f) => {
                match std::panic::AssertUnwindSafe(f(event)).catch_unwind().await {
                    Ok(()) => Ok(()),
                    Err(_) => Err("handler panicked".to_owned()),
                }
            }
            EventHandler::Sync(f) => {
                let permit = inner.sync_pool.clone().acquire_owned().await;
                match permit {
                    Ok(permit) => {
                        let f = f.clone();
                        let join = tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            f(event);
                        })
                        .await;
                        join.map_err(|e| e.to_string())
                    }
                    Err(_) => Err("sync pool closed".to_owned()),
                }
            }
        };
        match outcome {
            Ok(()) => inner
                .metrics
                .record_processed(start.elapsed().as_micros() as u64),
            Err(reason) => {
                error!(subscriber = %name, reason, "event handler failed");
                inner.metrics.record_failed();
            }
        }
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
