//! WebSocket connection handling.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `connection` | Upgrade handler, auth handshake, per-connection read/write loop |
//! | `session` | Per-connection state machine (`AwaitingAuth → Authenticated → Closed`) |
//!
//! ## Data Flow
//!
//! `connection` rejects malformed upgrades with HTTP 400, runs the auth
//! handshake against [`crate::gateway::Gateway::authenticate`], then loops:
//! outbound queue → socket, socket → [`crate::gateway::Gateway::dispatch`].
//! Cancellation (sweep, slow-consumer eviction) and client closes converge on
//! the same idempotent cleanup.

pub mod connection;
pub mod session;

pub use connection::{ConnectQuery, ws_handler};
