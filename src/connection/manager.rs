//! Connection lifecycle management.
//!
//! The manager owns the transport exclusively. A supervisor task runs the
//! read/write loop for the active session and the reconnect policy when
//! the session drops; inbound messages are published on an mpsc channel
//! that the client facade routes (the manager never calls back into
//! higher layers).
//!
//! Coordination rules:
//! - state transitions go through one `watch` channel, updated only while
//!   holding the connect flight lock or from the supervisor;
//! - a single flight lock serializes connect attempts, so a second caller
//!   awaits the first and observes its outcome;
//! - disconnect drains queued outbound frames, closes the transport, and
//!   is idempotent.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sd_protocol::{ClientMessage, ServerMessage};

use crate::connection::state::ConnectionState;
use crate::connection::transport::{BoxSink, BoxStream, TransportConnector};
use crate::error::ClientError;
use crate::events::{Event, EventBus};
use crate::resilience::{RetryConfig, RetryManager};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub reconnect: RetryConfig,
    pub outbound_capacity: usize,
    /// Default deadline for `send` when the caller supplies none.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(30),
            reconnect: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                ..RetryConfig::default()
            },
            outbound_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

struct ConnInner {
    connector: Arc<dyn TransportConnector>,
    config: ConnectionConfig,
    bus: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    outbound_rx: StdMutex<Option<mpsc::Receiver<ClientMessage>>>,
    inbound_tx: mpsc::Sender<ServerMessage>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    flight: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    last_heartbeat: StdMutex<Option<Instant>>,
}

impl ConnInner {
    fn set_state(&self, new: ConnectionState) {
        let old = *self.state_tx.borrow();
        if old == new {
            return;
        }
        let _ = self.state_tx.send(new);
        info!(from = %old, to = %new, "connection state changed");
        self.bus
            .publish(Event::connection_state_changed(old.as_str(), new.as_str()));
    }
}

/// Handle to a managed connection; cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl ConnectionManager {
    /// Create a manager. The returned receiver carries every inbound
    /// server message; the caller owns routing.
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        config: ConnectionConfig,
        bus: EventBus,
    ) -> (ConnectionManager, mpsc::Receiver<ServerMessage>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.outbound_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ConnInner {
            connector,
            config,
            bus,
            state_tx,
            outbound_tx,
            outbound_rx: StdMutex::new(Some(outbound_rx)),
            inbound_tx,
            supervisor: StdMutex::new(None),
            flight: Mutex::new(()),
            shutdown_tx,
            last_heartbeat: StdMutex::new(None),
        });
        (ConnectionManager { inner }, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.inner.last_heartbeat.lock().unwrap()
    }

    /// Establish the connection. Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _flight = self.inner.flight.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => {
                return Err(ClientError::ConnectionLost(
                    "connection permanently failed; create a new client".to_owned(),
                ))
            }
            _ => {}
        }
        let _ = self.inner.shutdown_tx.send(false);
        self.inner.set_state(ConnectionState::Connecting);

        let retry = RetryManager::new(self.inner.config.reconnect.clone());
        let connector = self.inner.connector.clone();
        let halves = retry
            .run("connect", move || {
                let connector = connector.clone();
                async move { connector.connect().await }
            })
            .await;

        match halves {
            Ok((sink, stream)) => {
                let rx = self
                    .inner
                    .outbound_rx
                    .lock()
                    .unwrap()
                    .take()
                    .expect("outbound receiver already taken by a live supervisor");
                let handle = tokio::spawn(supervisor(self.inner.clone(), sink, stream, rx));
                *self.inner.supervisor.lock().unwrap() = Some(handle);
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.inner.set_state(ConnectionState::Failed);
                Err(err)
            }
        }
    }

    /// Queue an outbound message, waiting up to `deadline` for capacity
    /// while a reconnect is in progress.
    pub async fn send(
        &self,
        msg: ClientMessage,
        deadline: Option<Duration>,
    ) -> Result<(), ClientError> {
        if !self.state().is_usable() {
            return Err(ClientError::ConnectionLost(format!(
                "not connected (state: {})",
                self.state()
            )));
        }
        let deadline = deadline.unwrap_or(self.inner.config.send_timeout);
        self.inner
            .outbound_tx
            .send_timeout(msg, deadline)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ClientError::Timeout(deadline),
                mpsc::error::SendTimeoutError::Closed(_) => {
                    ClientError::ConnectionLost("outbound channel closed".to_owned())
                }
            })
    }

    /// Close the connection, draining queued outbound work first.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let handle = self.inner.supervisor.lock().unwrap().take();
        match handle {
            Some(handle) => {
                let _ = self.inner.shutdown_tx.send(true);
                let _ = handle.await;
            }
            None => {
                self.inner.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

/// Session supervisor: pumps the read/write halves, applies the reconnect
/// policy when the session drops, and performs the drain-then-close
/// sequence on shutdown.
async fn supervisor(
    inner: Arc<ConnInner>,
    mut sink: BoxSink,
    mut stream: BoxStream,
    mut rx: mpsc::Receiver<ClientMessage>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    'session: loop {
        let mut session_alive = true;
        while session_alive {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'session;
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                warn!(error = %e, "send failed, session lost");
                                session_alive = false;
                            }
                        }
                        None => break 'session,
                    }
                }
                inbound = stream.next_message() => {
                    match inbound {
                        Ok(Some(msg)) => {
                            if let ServerMessage::Heartbeat(_) = &msg {
                                *inner.last_heartbeat.lock().unwrap() = Some(Instant::now());
                            }
                            if inner.inbound_tx.send(msg).await.is_err() {
                                debug!("inbound receiver dropped, stopping supervisor");
                                break 'session;
                            }
                        }
                        Ok(None) => {
                            warn!("server closed the connection");
                            session_alive = false;
                        }
                        Err(e) => {
                            warn!(error = %e, "transport error");
                            session_alive = false;
                        }
                    }
                }
            }
        }

        // Session lost: run the reconnect policy.
        inner.set_state(ConnectionState::Reconnecting);
        match reconnect(&inner, &mut shutdown).await {
            Some((new_sink, new_stream)) => {
                sink = new_sink;
                stream = new_stream;
                inner.set_state(ConnectionState::Connected);
            }
            None => {
                if *shutdown.borrow() {
                    break 'session;
                }
                inner.set_state(ConnectionState::Failed);
                *inner.outbound_rx.lock().unwrap() = Some(rx);
                return;
            }
        }
    }

    // Clean shutdown: drain pending outbound frames, then close.
    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    inner.set_state(ConnectionState::Disconnected);
    *inner.outbound_rx.lock().unwrap() = Some(rx);
}

/// Run the retry policy for a lost session. `None` when the budget is
/// exhausted or shutdown was requested.
async fn reconnect(
    inner: &Arc<ConnInner>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(BoxSink, BoxStream)> {
    let retry = RetryManager::new(inner.config.reconnect.clone());
    let max_attempts = inner.config.reconnect.max_attempts;
    for attempt in 0..max_attempts {
        if *shutdown.borrow() {
            return None;
        }
        let delay = retry.delay_for(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => { return None; }
            }
        }
        inner.set_state(ConnectionState::Connecting);
        match inner.connector.connect().await {
            Ok(halves) => {
                info!(attempt = attempt + 1, "reconnected");
                return Some(halves);
            }
            Err(e) => {
                warn!(attempt = attempt + 1, max_attempts, error = %e, "reconnect attempt failed");
                inner.set_state(ConnectionState::Reconnecting);
            }
        }
    }
    None
}
