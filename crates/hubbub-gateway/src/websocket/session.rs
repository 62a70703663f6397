//! Per-connection session state.

use hubbub_core::errors::GatewayError;
use hubbub_core::ids::{ConnectionId, UserId, WorkspaceId};

/// Lifecycle state of one connection.
///
/// Moves forward only: a connection authenticates at most once, and a closed
/// connection never leaves `Closed`. Reconnecting means a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Upgraded, no credential presented yet. Only `auth` is admissible.
    AwaitingAuth,
    /// Credential and membership verified.
    Authenticated,
    /// Terminal.
    Closed,
}

/// Identity and state attached to one connection for its lifetime.
///
/// The workspace and user ids are the claims made at upgrade time; they are
/// trusted only once [`authenticate`](ConnectionContext::authenticate) has
/// run.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    /// Gateway-local connection id.
    pub id: ConnectionId,
    /// Workspace claimed at upgrade.
    pub workspace_id: WorkspaceId,
    /// User claimed at upgrade.
    pub user_id: UserId,
    state: ConnState,
}

impl ConnectionContext {
    /// Context for a freshly upgraded, unauthenticated connection.
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, user_id: UserId) -> Self {
        Self {
            id: ConnectionId::new(),
            workspace_id,
            user_id,
            state: ConnState::AwaitingAuth,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    /// Whether the connection has authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, ConnState::Authenticated)
    }

    /// Move `AwaitingAuth → Authenticated`. Any other starting state is an
    /// error: the transition happens at most once per connection.
    pub fn authenticate(&mut self) -> Result<(), GatewayError> {
        match self.state {
            ConnState::AwaitingAuth => {
                self.state = ConnState::Authenticated;
                Ok(())
            }
            ConnState::Authenticated => Err(GatewayError::validation(
                "already_authenticated",
                "connection is already authenticated",
            )),
            ConnState::Closed => Err(GatewayError::validation(
                "bad_request",
                "connection is closed",
            )),
        }
    }

    /// Move to `Closed`. Idempotent.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
