//! Connection layer: transport abstraction, lifecycle state machine,
//! reconnect supervision and the scope-managed connection pool.

pub mod manager;
pub mod pool;
pub mod state;
pub mod transport;

pub use manager::{ConnectionConfig, ConnectionManager};
pub use pool::{ConnectionFactory, ConnectionLease, ConnectionPool, PoolConfig};
pub use state::ConnectionState;
pub use transport::{BoxSink, BoxStream, TransportConnector, TransportSink, TransportStream, WsConnector};
