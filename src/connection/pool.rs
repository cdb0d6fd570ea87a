//! Scope-managed connection pool.
//!
//! Callers never hold a raw connection: [`ConnectionPool::lease`] yields a
//! [`ConnectionLease`] guard, and dropping the guard returns the
//! connection to the pool (when pooling is enabled and the connection is
//! still healthy) or closes it. Pool membership is bounded by a semaphore;
//! idle connections expire after `idle_ttl`.

use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::manager::ConnectionManager;
use crate::connection::state::ConnectionState;
use crate::error::ClientError;

/// Builds a connected manager on demand. The factory owns wiring the
/// inbound message routing for each connection it creates.
pub type ConnectionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ConnectionManager, ClientError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_ttl: Duration,
    /// When false, released connections close instead of idling.
    pub pooling: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 0,
            max_size: 4,
            idle_ttl: Duration::from_secs(60),
            pooling: true,
        }
    }
}

struct IdleEntry {
    manager: ConnectionManager,
    idled_at: Instant,
}

struct PoolInner {
    factory: ConnectionFactory,
    config: PoolConfig,
    idle: Mutex<Vec<IdleEntry>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory, config: PoolConfig) -> ConnectionPool {
        let permits = Arc::new(Semaphore::new(config.max_size.max(1)));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                factory,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
            }),
        }
    }

    /// Pre-connect up to `min_size` idle connections.
    pub async fn warm_up(&self) -> Result<(), ClientError> {
        loop {
            {
                let idle = self.inner.idle.lock().unwrap();
                if idle.len() >= self.inner.config.min_size {
                    return Ok(());
                }
            }
            let manager = (self.inner.factory)().await?;
            self.inner.idle.lock().unwrap().push(IdleEntry {
                manager,
                idled_at: Instant::now(),
            });
        }
    }

    /// Borrow a connection for the scope of the returned lease.
    ///
    /// Reuses a fresh idle connection when available, otherwise builds a
    /// new one; blocks while `max_size` leases are outstanding.
    pub async fn lease(&self) -> Result<ConnectionLease, ClientError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::ConnectionLost("pool closed".to_owned()))?;

        loop {
            let candidate = self.inner.idle.lock().unwrap().pop();
            match candidate {
                Some(entry) => {
                    let fresh = entry.idled_at.elapsed() < self.inner.config.idle_ttl
                        && entry.manager.state() == ConnectionState::Connected;
                    if fresh {
                        debug!("leasing idle connection");
                        return Ok(ConnectionLease {
                            manager: Some(entry.manager),
                            pool: Arc::downgrade(&self.inner),
                            _permit: permit,
                        });
                    }
                    // Stale or unhealthy: close it and look again.
                    let stale = entry.manager;
                    tokio::spawn(async move { stale.disconnect().await });
                }
                None => break,
            }
        }

        let manager = (self.inner.factory)().await?;
        Ok(ConnectionLease {
            manager: Some(manager),
            pool: Arc::downgrade(&self.inner),
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Close every idle connection; outstanding leases close on release.
    pub async fn shutdown(&self) {
        let drained: Vec<IdleEntry> = std::mem::take(&mut *self.inner.idle.lock().unwrap());
        for entry in drained {
            entry.manager.disconnect().await;
        }
        self.inner.permits.close();
    }
}

/// Scoped borrow of a pooled connection. Guaranteed release on every
/// path: dropping the lease returns the connection to the pool or closes
/// it in the background.
pub struct ConnectionLease {
    manager: Option<ConnectionManager>,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ConnectionLease {
    type Target = ConnectionManager;

    fn deref(&self) -> &ConnectionManager {
        self.manager.as_ref().expect("lease already released")
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let manager = match self.manager.take() {
            Some(m) => m,
            None => return,
        };
        if let Some(pool) = self.pool.upgrade() {
            if pool.config.pooling && manager.state() == ConnectionState::Connected {
                pool.idle.lock().unwrap().push(IdleEntry {
                    manager,
                    idled_at: Instant::now(),
                });
                return;
            }
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { manager.disconnect().await });
        }
    }
}
