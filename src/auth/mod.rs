//! Identity and token subsystem: Ed25519 keypairs, the on-disk identity
//! store, the signed authentication handshake, and TTL-managed tokens.

pub mod handshake;
pub mod identity;
pub mod token;

pub use handshake::AuthFlow;
pub use identity::{Identity, IdentityStore};
pub use token::{AuthToken, TokenManager, TokenRefresher};
