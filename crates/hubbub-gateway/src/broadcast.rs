//! Event fan-out to live connections.
//!
//! Broadcast is best-effort per recipient: the event is serialized exactly
//! once per call, then `try_send` onto each matching connection's bounded
//! outbound queue. A full queue costs the recipient one drop; a connection
//! that keeps dropping past its lifetime budget is force-closed. Nothing a
//! slow consumer does ever propagates an error to the sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubbub_core::events::{CLOSE_NORMAL, ServerEvent};
use hubbub_core::ids::{ConnectionId, UserId, WorkspaceId};

use crate::metrics::WS_BROADCAST_DROPS_TOTAL;

/// How a forced close should present itself on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseIntent {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason string.
    pub reason: &'static str,
}

impl CloseIntent {
    /// Idle-timeout close: normal code, reason `"inactive"`.
    #[must_use]
    pub const fn inactive() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: hubbub_core::events::CLOSE_REASON_INACTIVE,
        }
    }

    /// Slow-consumer eviction.
    #[must_use]
    pub const fn slow_consumer() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: "slow consumer",
        }
    }
}

/// The router's grip on one authenticated connection.
///
/// Owned by the router and the connection task; everything here is safe to
/// poke from any thread.
pub struct ConnectionHandle {
    /// Gateway-local connection id.
    pub id: ConnectionId,
    /// Workspace the connection authenticated into.
    pub workspace_id: WorkspaceId,
    /// Authenticated user.
    pub user_id: UserId,
    outbound: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
    close_intent: Mutex<Option<CloseIntent>>,
    drops: AtomicU64,
}

impl ConnectionHandle {
    /// Create a handle over a connection's outbound queue and cancel token.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        workspace_id: WorkspaceId,
        user_id: UserId,
        outbound: mpsc::Sender<Arc<str>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            workspace_id,
            user_id,
            outbound,
            cancel,
            close_intent: Mutex::new(None),
            drops: AtomicU64::new(0),
        }
    }

    /// Enqueue an already-encoded frame. Returns `false` on a full or closed
    /// queue, counting one drop.
    pub fn send(&self, frame: Arc<str>) -> bool {
        if self.outbound.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.drops.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode and enqueue an event for this connection only.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::from(json)),
            Err(e) => {
                warn!(event_type = event.tag(), error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Lifetime count of dropped frames.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Ask the connection task to close with the given presentation.
    ///
    /// The first intent wins; later calls only re-trigger cancellation.
    pub fn close(&self, intent: CloseIntent) {
        let _ = self.close_intent.lock().get_or_insert(intent);
        self.cancel.cancel();
    }

    /// The intent recorded by [`close`](Self::close), if any.
    pub fn close_intent(&self) -> Option<CloseIntent> {
        *self.close_intent.lock()
    }

    /// Token the connection task selects on.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Fan-out router over all authenticated connections.
pub struct BroadcastRouter {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    /// Tracked separately so count queries never take the map lock.
    active_count: AtomicUsize,
    max_drops: u64,
}

impl BroadcastRouter {
    /// Create a router with the given per-connection lifetime drop budget.
    #[must_use]
    pub fn new(max_drops: u64) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            max_drops,
        }
    }

    /// Register an authenticated connection.
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        let mut connections = self.connections.write();
        if connections.insert(handle.id.clone(), handle).is_none() {
            let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a connection. Idempotent.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.write().remove(connection_id);
        if removed.is_some() {
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Look up a live connection.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Fan an event out to every connection in the workspace.
    pub fn broadcast_workspace(&self, workspace_id: WorkspaceId, event: &ServerEvent) {
        self.broadcast_to(|c| c.workspace_id == workspace_id, event);
    }

    /// Fan an event out to the workspace, excluding one connection.
    ///
    /// Used for the `online` announcement: the arriving connection already
    /// holds the roster from its `presence_sync` snapshot.
    pub fn broadcast_workspace_except(
        &self,
        workspace_id: WorkspaceId,
        excluded: &ConnectionId,
        event: &ServerEvent,
    ) {
        self.broadcast_to(
            |c| c.workspace_id == workspace_id && c.id != *excluded,
            event,
        );
    }

    /// Fan an event out to the given users' connections in the workspace.
    ///
    /// Used for channel-scoped events: the caller resolves channel membership
    /// first, the router only matches on identity.
    pub fn broadcast_users(
        &self,
        workspace_id: WorkspaceId,
        users: &[UserId],
        event: &ServerEvent,
    ) {
        self.broadcast_to(
            |c| c.workspace_id == workspace_id && users.contains(&c.user_id),
            event,
        );
    }

    /// Serialize once, fan out to matching connections, evict slow consumers.
    fn broadcast_to(&self, filter: impl Fn(&ConnectionHandle) -> bool, event: &ServerEvent) {
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(event_type = event.tag(), error = %e, "failed to serialize event");
                return;
            }
        };
        let mut to_evict = Vec::new();
        {
            let connections = self.connections.read();
            let mut recipients = 0u32;
            for handle in connections.values() {
                if filter(handle) {
                    recipients += 1;
                    if !handle.send(Arc::clone(&frame)) {
                        counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                        let drops = handle.drop_count();
                        if drops >= self.max_drops {
                            warn!(conn_id = %handle.id, drops, "disconnecting slow consumer");
                            to_evict.push(Arc::clone(handle));
                        } else {
                            debug!(conn_id = %handle.id, drops, "outbound queue full, frame dropped");
                        }
                    }
                }
            }
            debug!(event_type = event.tag(), recipients, "broadcast event");
        }
        for handle in to_evict {
            handle.close(CloseIntent::slow_consumer());
            let _ = self.remove(&handle.id);
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hubbub_core::events::PresenceStatus;

    const WS: WorkspaceId = WorkspaceId::new(7);
    const OTHER_WS: WorkspaceId = WorkspaceId::new(8);

    fn make_handle(
        id: &str,
        workspace_id: WorkspaceId,
        user_id: u64,
        capacity: usize,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = ConnectionHandle::new(
            ConnectionId::from(id),
            workspace_id,
            UserId::new(user_id),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(handle), rx)
    }

    fn presence_event(user_id: u64) -> ServerEvent {
        ServerEvent::Presence {
            user_id: UserId::new(user_id),
            status: PresenceStatus::Online,
            custom_status: None,
        }
    }

    #[tokio::test]
    async fn add_remove_count() {
        let router = BroadcastRouter::new(100);
        let (c1, _rx1) = make_handle("c1", WS, 1, 8);
        let (c2, _rx2) = make_handle("c2", WS, 2, 8);
        router.add(c1);
        router.add(c2);
        assert_eq!(router.connection_count(), 2);
        assert!(router.remove(&ConnectionId::from("c1")).is_some());
        assert!(router.remove(&ConnectionId::from("c1")).is_none());
        assert_eq!(router.connection_count(), 1);
    }

    #[tokio::test]
    async fn workspace_broadcast_reaches_only_that_workspace() {
        let router = BroadcastRouter::new(100);
        let (c1, mut rx1) = make_handle("c1", WS, 1, 8);
        let (c2, mut rx2) = make_handle("c2", OTHER_WS, 2, 8);
        router.add(c1);
        router.add(c2);

        router.broadcast_workspace(WS, &presence_event(1));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn workspace_broadcast_can_exclude_one_connection() {
        let router = BroadcastRouter::new(100);
        let (c1, mut rx1) = make_handle("c1", WS, 1, 8);
        let (c2, mut rx2) = make_handle("c2", WS, 2, 8);
        router.add(c1);
        router.add(c2);

        router.broadcast_workspace_except(WS, &ConnectionId::from("c1"), &presence_event(1));

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn user_scoped_broadcast_filters_members() {
        let router = BroadcastRouter::new(100);
        let (c1, mut rx1) = make_handle("c1", WS, 1, 8);
        let (c2, mut rx2) = make_handle("c2", WS, 2, 8);
        let (c3, mut rx3) = make_handle("c3", WS, 3, 8);
        router.add(c1);
        router.add(c2);
        router.add(c3);

        router.broadcast_users(WS, &[UserId::new(1), UserId::new(3)], &presence_event(1));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_ok());
    }

    #[tokio::test]
    async fn user_scoped_broadcast_respects_workspace_boundary() {
        let router = BroadcastRouter::new(100);
        // Same user id, different workspace: must not receive.
        let (c1, mut rx1) = make_handle("c1", OTHER_WS, 1, 8);
        router.add(c1);

        router.broadcast_users(WS, &[UserId::new(1)], &presence_event(1));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn encoding_is_shared_across_recipients() {
        let router = BroadcastRouter::new(100);
        let (c1, mut rx1) = make_handle("c1", WS, 1, 8);
        let (c2, mut rx2) = make_handle("c2", WS, 2, 8);
        router.add(c1);
        router.add(c2);

        router.broadcast_workspace(WS, &presence_event(1));

        let f1 = rx1.try_recv().unwrap();
        let f2 = rx2.try_recv().unwrap();
        // Both recipients share one encoding.
        assert!(Arc::ptr_eq(&f1, &f2));
        let value: serde_json::Value = serde_json::from_str(&f1).unwrap();
        assert_eq!(value["type"], "presence");
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_others() {
        let router = BroadcastRouter::new(100);
        let (slow, _slow_rx) = make_handle("slow", WS, 1, 1);
        let (fast, mut fast_rx) = make_handle("fast", WS, 2, 64);
        router.add(slow);
        router.add(fast);

        for _ in 0..5 {
            router.broadcast_workspace(WS, &presence_event(1));
        }
        // Fast client got all five; the slow one's overflow was its own
        // problem.
        for _ in 0..5 {
            assert!(fast_rx.try_recv().is_ok());
        }
        assert_eq!(router.connection_count(), 2);
    }

    #[tokio::test]
    async fn slow_consumer_evicted_after_drop_budget() {
        let router = BroadcastRouter::new(3);
        let (slow, _slow_rx) = make_handle("slow", WS, 1, 1);
        let token = slow.cancel_token();
        router.add(Arc::clone(&slow));

        // First broadcast fills the queue; the next three exhaust the budget.
        for _ in 0..4 {
            router.broadcast_workspace(WS, &presence_event(1));
        }

        assert_eq!(router.connection_count(), 0);
        assert!(token.is_cancelled());
        assert_eq!(slow.close_intent(), Some(CloseIntent::slow_consumer()));
    }

    #[tokio::test]
    async fn send_event_encodes_for_one_connection() {
        let (handle, mut rx) = make_handle("c1", WS, 1, 8);
        assert!(handle.send_event(&presence_event(9)));
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"]["userId"], 9);
    }

    #[tokio::test]
    async fn first_close_intent_wins() {
        let (handle, _rx) = make_handle("c1", WS, 1, 8);
        handle.close(CloseIntent::inactive());
        handle.close(CloseIntent::slow_consumer());
        assert_eq!(handle.close_intent(), Some(CloseIntent::inactive()));
        assert!(handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn broadcast_to_empty_router_is_fine() {
        let router = BroadcastRouter::new(100);
        router.broadcast_workspace(WS, &presence_event(1));
        router.broadcast_users(WS, &[], &presence_event(1));
    }
}
