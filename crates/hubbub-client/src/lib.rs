//! # hubbub-client
//!
//! The client half of the realtime protocol: a background connection loop
//! that owns reconnect backoff, re-authentication on reconnect, and dispatch
//! of inbound events to subscribers.
//!
//! One [`connection::RealtimeClient`] owns one logical connection. The state
//! machine (`Idle → Connecting → Open → Reconnecting → Idle`) lives in a
//! single background task; there is never more than one in-flight connection
//! attempt, and the previous transport is fully torn down before the next
//! attempt starts. Sends while not authenticated fail immediately — nothing
//! is queued.

#![deny(unsafe_code)]

pub mod connection;
pub mod types;

pub use connection::RealtimeClient;
pub use types::{ClientConfig, ClientError, ClientNotification, ConnState};
