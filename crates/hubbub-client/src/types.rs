//! Client-side configuration, state and notifications.

use std::time::Duration;

use thiserror::Error;

use hubbub_core::events::ServerEvent;
use hubbub_core::ids::{UserId, WorkspaceId};
use hubbub_core::retry::ReconnectPolicy;

/// Default dial timeout for one connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Everything needed to reach and authenticate against a gateway.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Gateway websocket endpoint, e.g. `ws://127.0.0.1:4000/ws`.
    pub endpoint: String,
    /// Workspace to connect into.
    pub workspace_id: WorkspaceId,
    /// User the bearer token belongs to.
    pub user_id: UserId,
    /// Bearer token sent in the `auth` event after every (re)open.
    pub token: String,
    /// Backoff schedule and retry budget for abnormal closes.
    pub reconnect: ReconnectPolicy,
    /// Dial timeout per attempt (ms).
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    /// Config with default reconnect policy and timeouts.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        workspace_id: WorkspaceId,
        user_id: UserId,
        token: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            workspace_id,
            user_id,
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// The full upgrade URL with identity claims.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!(
            "{}?workspace_id={}&user_id={}",
            self.endpoint, self.workspace_id, self.user_id
        )
    }

    /// Dial timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Lifecycle state of the client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Not connected and not trying to be.
    Idle,
    /// A dial is in flight.
    Connecting,
    /// Transport open; `authenticated` flips once the gateway accepts the
    /// credential (signalled by the `presence_sync` snapshot).
    Open {
        /// Whether the auth handshake completed.
        authenticated: bool,
    },
    /// Waiting out the backoff before attempt `attempt`.
    Reconnecting {
        /// 1-based reconnect attempt number.
        attempt: u32,
    },
}

/// What the background loop tells subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotification {
    /// Transport opened; the `auth` event has been sent.
    Connected,
    /// The gateway accepted the credential and sent the presence snapshot.
    Authenticated {
        /// Users currently online in the workspace.
        online_users: Vec<UserId>,
    },
    /// Any other inbound event.
    Event(ServerEvent),
    /// The connection ended.
    Disconnected {
        /// Whether the loop will retry with backoff.
        will_retry: bool,
    },
    /// The gateway rejected the credential; the loop will not retry with the
    /// same token.
    AuthRejected {
        /// The gateway's error code (`auth_failed`, `not_a_member`, ...).
        code: String,
    },
    /// The retry budget is exhausted; the loop has stopped.
    GaveUp,
}

/// Why a send was rejected locally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The connection is not open and authenticated. Nothing is queued;
    /// callers must treat "not connected" as an observable condition.
    #[error("not connected")]
    NotConnected,
    /// The outbound command queue is full.
    #[error("send queue full")]
    QueueFull,
    /// The background task is gone.
    #[error("client is closed")]
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
