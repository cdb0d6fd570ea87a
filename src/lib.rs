//! stardrift-client: unified client runtime for the stardrift game
//! server family.
//!
//! Sits between application code and the wire: connection management with
//! bounded-retry reconnection and pooled leases, per-dialect protocol
//! adaptation, a validate/adapt/encode serialization pipeline, Ed25519
//! identities with TTL-managed bearer tokens, per-table subscriptions
//! with a local row cache, a correlated reducer dispatcher, and a
//! priority-aware event bus, all assembled behind [`GameClient`].
//!
//! ```no_run
//! use stardrift_client::{ClientConfig, GameClient};
//!
//! # async fn run() -> Result<(), stardrift_client::ClientError> {
//! let config = ClientConfig::from_env()?;
//! config.init_tracing();
//! let client = GameClient::new(config);
//! client.connect().await?;
//! client.subscribe(&["player", "entity"]).await?;
//! client.enter_game("P1").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod reducer;
pub mod report;
pub mod resilience;
pub mod subscription;

pub use client::{ClientStats, GameClient};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorGroup};

pub use sd_core as core;
pub use sd_protocol as protocol;
