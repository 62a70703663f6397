//! Presence registry: who is online where.
//!
//! One entry per live authenticated connection; a user with three tabs open
//! holds three entries. "Online in workspace W" is derived from entry
//! existence, never tracked as a separate boolean. All maps are guarded by
//! `parking_lot` locks with narrow scope — the registry makes no network
//! calls and is never held across an await point.
//!
//! Timestamps use [`tokio::time::Instant`] so tests can drive a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use hubbub_core::ids::{ConnectionId, UserId, WorkspaceId};

/// Bookkeeping for one live authenticated connection.
#[derive(Clone, Debug)]
pub struct PresenceEntry {
    /// Workspace the connection authenticated into.
    pub workspace_id: WorkspaceId,
    /// Authenticated user.
    pub user_id: UserId,
    /// Last successfully dispatched event.
    pub last_activity: Instant,
}

/// Outcome of removing a connection from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Departure {
    /// The connection was not registered (second close of the same
    /// connection, or it never authenticated). Nothing to broadcast.
    NotRegistered,
    /// Other connections for the same (workspace, user) remain online.
    OthersRemain {
        /// Workspace the connection was in.
        workspace_id: WorkspaceId,
        /// User the connection belonged to.
        user_id: UserId,
    },
    /// This was the user's last connection in the workspace; broadcast
    /// `offline`.
    LastForUser {
        /// Workspace the connection was in.
        workspace_id: WorkspaceId,
        /// User the connection belonged to.
        user_id: UserId,
    },
}

/// In-memory registry of live authenticated connections.
pub struct PresenceRegistry {
    entries: RwLock<HashMap<ConnectionId, PresenceEntry>>,
    /// Last `online` broadcast per (workspace, user), for damping.
    recent_online: Mutex<HashMap<(WorkspaceId, UserId), Instant>>,
    damp_window: Duration,
}

impl PresenceRegistry {
    /// Create a registry with the given `online` damping window.
    #[must_use]
    pub fn new(damp_window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            recent_online: Mutex::new(HashMap::new()),
            damp_window,
        }
    }

    /// Register a freshly authenticated connection.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) {
        let entry = PresenceEntry {
            workspace_id,
            user_id,
            last_activity: Instant::now(),
        };
        let _ = self.entries.write().insert(connection_id, entry);
    }

    /// Remove a connection; reports whether the user just went offline.
    ///
    /// Idempotent: removing an unknown connection is a no-op that reports
    /// [`Departure::NotRegistered`], so racing close paths cannot
    /// double-broadcast `offline`.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Departure {
        let mut entries = self.entries.write();
        let Some(removed) = entries.remove(connection_id) else {
            return Departure::NotRegistered;
        };
        let others_remain = entries
            .values()
            .any(|e| e.workspace_id == removed.workspace_id && e.user_id == removed.user_id);
        if others_remain {
            Departure::OthersRemain {
                workspace_id: removed.workspace_id,
                user_id: removed.user_id,
            }
        } else {
            Departure::LastForUser {
                workspace_id: removed.workspace_id,
                user_id: removed.user_id,
            }
        }
    }

    /// Deduplicated, sorted ids of users online in the workspace.
    #[must_use]
    pub fn online_users(&self, workspace_id: WorkspaceId) -> Vec<UserId> {
        let entries = self.entries.read();
        let mut users: Vec<UserId> = entries
            .values()
            .filter(|e| e.workspace_id == workspace_id)
            .map(|e| e.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Whether the user has at least one live connection in the workspace.
    #[must_use]
    pub fn is_online(&self, workspace_id: WorkspaceId, user_id: UserId) -> bool {
        self.entries
            .read()
            .values()
            .any(|e| e.workspace_id == workspace_id && e.user_id == user_id)
    }

    /// Record activity on a connection.
    pub fn touch(&self, connection_id: &ConnectionId) {
        if let Some(entry) = self.entries.write().get_mut(connection_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Connections idle longer than `max_idle`, with their identity.
    #[must_use]
    pub fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) > max_idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether an `online` broadcast for this (workspace, user) should go out
    /// now, and record it if so.
    ///
    /// Damps multi-tab reconnect storms: a second `online` within the damping
    /// window is suppressed. `offline` is deliberately not damped — it only
    /// fires for the last connection, and suppressing it would leave ghost
    /// entries in client rosters.
    pub fn should_announce_online(&self, workspace_id: WorkspaceId, user_id: UserId) -> bool {
        let now = Instant::now();
        let mut recent = self.recent_online.lock();
        recent.retain(|_, at| now.duration_since(*at) < self.damp_window);
        match recent.get(&(workspace_id, user_id)) {
            Some(_) => false,
            None => {
                let _ = recent.insert((workspace_id, user_id), now);
                true
            }
        }
    }

    /// Number of live registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    const WS: WorkspaceId = WorkspaceId::new(7);
    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn register_and_query() {
        let registry = registry();
        registry.register(ConnectionId::from("c1"), WS, ALICE);
        assert!(registry.is_online(WS, ALICE));
        assert!(!registry.is_online(WS, BOB));
        assert_eq!(registry.online_users(WS), vec![ALICE]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn online_users_deduplicates_multi_tab() {
        let registry = registry();
        registry.register(ConnectionId::from("tab1"), WS, ALICE);
        registry.register(ConnectionId::from("tab2"), WS, ALICE);
        registry.register(ConnectionId::from("c3"), WS, BOB);
        assert_eq!(registry.online_users(WS), vec![ALICE, BOB]);
    }

    #[tokio::test]
    async fn online_users_scoped_to_workspace() {
        let registry = registry();
        registry.register(ConnectionId::from("c1"), WS, ALICE);
        registry.register(ConnectionId::from("c2"), WorkspaceId::new(8), BOB);
        assert_eq!(registry.online_users(WS), vec![ALICE]);
        assert_eq!(registry.online_users(WorkspaceId::new(8)), vec![BOB]);
    }

    #[tokio::test]
    async fn offline_only_after_last_connection() {
        let registry = registry();
        registry.register(ConnectionId::from("tab1"), WS, ALICE);
        registry.register(ConnectionId::from("tab2"), WS, ALICE);

        assert_eq!(
            registry.unregister(&ConnectionId::from("tab1")),
            Departure::OthersRemain {
                workspace_id: WS,
                user_id: ALICE
            }
        );
        assert!(registry.is_online(WS, ALICE));

        assert_eq!(
            registry.unregister(&ConnectionId::from("tab2")),
            Departure::LastForUser {
                workspace_id: WS,
                user_id: ALICE
            }
        );
        assert!(!registry.is_online(WS, ALICE));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = registry();
        registry.register(ConnectionId::from("c1"), WS, ALICE);
        assert_eq!(
            registry.unregister(&ConnectionId::from("c1")),
            Departure::LastForUser {
                workspace_id: WS,
                user_id: ALICE
            }
        );
        assert_eq!(
            registry.unregister(&ConnectionId::from("c1")),
            Departure::NotRegistered
        );
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn same_user_other_workspace_does_not_hold_presence() {
        let registry = registry();
        registry.register(ConnectionId::from("c1"), WS, ALICE);
        registry.register(ConnectionId::from("c2"), WorkspaceId::new(8), ALICE);
        assert_eq!(
            registry.unregister(&ConnectionId::from("c1")),
            Departure::LastForUser {
                workspace_id: WS,
                user_id: ALICE
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_respect_cutoff() {
        let registry = registry();
        registry.register(ConnectionId::from("old"), WS, ALICE);
        time::advance(Duration::from_secs(200)).await;
        registry.register(ConnectionId::from("fresh"), WS, BOB);
        time::advance(Duration::from_secs(150)).await;

        // "old" is 350s idle, "fresh" 150s.
        let idle = registry.idle_connections(Duration::from_secs(300));
        assert_eq!(idle, vec![ConnectionId::from("old")]);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idleness() {
        let registry = registry();
        registry.register(ConnectionId::from("c1"), WS, ALICE);
        time::advance(Duration::from_secs(290)).await;
        registry.touch(&ConnectionId::from("c1"));
        time::advance(Duration::from_secs(290)).await;
        assert!(
            registry
                .idle_connections(Duration::from_secs(300))
                .is_empty()
        );
        time::advance(Duration::from_secs(20)).await;
        assert_eq!(registry.idle_connections(Duration::from_secs(300)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn online_announcement_damped_within_window() {
        let registry = registry();
        assert!(registry.should_announce_online(WS, ALICE));
        assert!(!registry.should_announce_online(WS, ALICE));

        time::advance(Duration::from_secs(2)).await;
        assert!(!registry.should_announce_online(WS, ALICE));

        time::advance(Duration::from_secs(4)).await;
        assert!(registry.should_announce_online(WS, ALICE));
    }

    #[tokio::test]
    async fn damping_is_per_user_and_workspace() {
        let registry = registry();
        assert!(registry.should_announce_online(WS, ALICE));
        assert!(registry.should_announce_online(WS, BOB));
        assert!(registry.should_announce_online(WorkspaceId::new(8), ALICE));
    }
}
