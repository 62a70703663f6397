//! The gateway: one explicitly-constructed instance owns every piece of
//! shared state and every background task.
//!
//! The process entry point builds a [`Gateway`] with its collaborators and
//! passes the `Arc` to whatever needs it — there is no static accessor and no
//! ambient global. Connection tasks call into it for authentication, dispatch
//! and cleanup; the REST backend publishes workspace events through it.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hubbub_core::errors::GatewayError;
use hubbub_core::events::{ClientEvent, MemberRole, PresenceStatus, ServerEvent};
use hubbub_core::ids::{ChannelId, ConnectionId, ThreadId, UserId, WorkspaceId};
use hubbub_core::message::NewMessage;

use crate::auth::{CredentialVerifier, MembershipDirectory, MessageStore};
use crate::broadcast::{BroadcastRouter, CloseIntent, ConnectionHandle};
use crate::config::GatewayConfig;
use crate::metrics::{
    AUTH_FAILURES_TOTAL, CHAT_MESSAGES_TOTAL, IDLE_SWEEP_CLOSES_TOTAL, PRESENCE_BROADCASTS_TOTAL,
    TYPING_BURSTS_TOTAL,
};
use crate::presence::{Departure, PresenceRegistry};
use crate::rate_limit::SlidingWindow;
use crate::typing::{TypingDebouncer, TypingKey};

/// The realtime gateway.
pub struct Gateway {
    config: GatewayConfig,
    presence: PresenceRegistry,
    router: BroadcastRouter,
    typing: TypingDebouncer,
    limiter: SlidingWindow<UserId>,
    verifier: Arc<dyn CredentialVerifier>,
    directory: Arc<dyn MembershipDirectory>,
    store: Arc<dyn MessageStore>,
}

impl Gateway {
    /// Construct a gateway and spawn its background tasks (typing-expiry
    /// drain, inactivity sweep). Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        config: GatewayConfig,
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn MembershipDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<Self> {
        let (typing, typing_expired) = TypingDebouncer::new(config.typing_expiry());
        let gateway = Arc::new(Self {
            presence: PresenceRegistry::new(config.presence_damp()),
            router: BroadcastRouter::new(config.max_send_drops),
            typing,
            limiter: SlidingWindow::new(config.event_rate.clone()),
            config,
            verifier,
            directory,
            store,
        });

        let drain = Arc::clone(&gateway);
        drop(tokio::spawn(drain_typing_expiries(drain, typing_expired)));

        let sweeper = Arc::clone(&gateway);
        drop(tokio::spawn(async move {
            let interval = sweeper.config.sweep_interval();
            loop {
                tokio::time::sleep(interval).await;
                sweeper.sweep_idle();
            }
        }));

        gateway
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The presence registry.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// The broadcast router.
    #[must_use]
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    // ─────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────

    /// Verify a bearer credential against the identity claimed at upgrade.
    ///
    /// Three gates, in order: the token verifies, its subject matches the
    /// claimed user id, and the subject is a member of the claimed workspace.
    pub async fn authenticate(
        &self,
        workspace_id: WorkspaceId,
        claimed_user: UserId,
        token: &str,
    ) -> Result<MemberRole, GatewayError> {
        let credential = self.verifier.verify(token).await.map_err(|e| {
            counter!(AUTH_FAILURES_TOTAL, "code" => "auth_failed").increment(1);
            GatewayError::authentication(e.to_string())
        })?;
        if credential.subject != claimed_user {
            counter!(AUTH_FAILURES_TOTAL, "code" => "auth_failed").increment(1);
            return Err(GatewayError::authentication(
                "token subject does not match claimed user id",
            ));
        }
        let role = self
            .directory
            .role_in_workspace(workspace_id, claimed_user)
            .await
            .map_err(|e| GatewayError::downstream(e.to_string()))?;
        role.ok_or_else(|| {
            counter!(AUTH_FAILURES_TOTAL, "code" => "not_a_member").increment(1);
            GatewayError::not_a_member(format!(
                "user {claimed_user} is not a member of workspace {workspace_id}"
            ))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Register a freshly authenticated connection.
    ///
    /// Order matters: the presence snapshot is enqueued on this connection
    /// before the `online` broadcast, so the newcomer always sees the roster
    /// before anything derived from their own arrival. The `online` broadcast
    /// is damped against multi-tab reconnect storms.
    pub fn on_authenticated(&self, handle: &Arc<ConnectionHandle>) {
        self.presence
            .register(handle.id.clone(), handle.workspace_id, handle.user_id);
        self.router.add(Arc::clone(handle));

        let snapshot = ServerEvent::PresenceSync {
            online_users: self.presence.online_users(handle.workspace_id),
        };
        let _ = handle.send_event(&snapshot);

        if self
            .presence
            .should_announce_online(handle.workspace_id, handle.user_id)
        {
            counter!(PRESENCE_BROADCASTS_TOTAL, "status" => "online").increment(1);
            self.router.broadcast_workspace_except(
                handle.workspace_id,
                &handle.id,
                &ServerEvent::Presence {
                    user_id: handle.user_id,
                    status: PresenceStatus::Online,
                    custom_status: None,
                },
            );
        }
        info!(conn_id = %handle.id, workspace_id = %handle.workspace_id, user_id = %handle.user_id, "connection authenticated");
    }

    /// Tear down a connection. Idempotent: every close path (client close,
    /// sweep, slow-consumer eviction, error) converges here, and the presence
    /// entry's single removal decides whether anything is broadcast.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        // The router may already have evicted the handle (slow consumer);
        // presence is the authority on whether cleanup already ran.
        let _ = self.router.remove(connection_id);
        match self.presence.unregister(connection_id) {
            Departure::NotRegistered => {}
            Departure::OthersRemain { .. } => {
                debug!(conn_id = %connection_id, "connection closed, user still online elsewhere");
            }
            Departure::LastForUser {
                workspace_id,
                user_id,
            } => {
                debug!(conn_id = %connection_id, %user_id, "connection closed, user now offline");
                counter!(PRESENCE_BROADCASTS_TOTAL, "status" => "offline").increment(1);
                self.router.broadcast_workspace(
                    workspace_id,
                    &ServerEvent::Presence {
                        user_id,
                        status: PresenceStatus::Offline,
                        custom_status: None,
                    },
                );
                // The user is gone entirely; end their composing indicators
                // too.
                for key in self.typing.clear_user(user_id) {
                    if let Err(e) = self.broadcast_typing(key, false).await {
                        warn!(error = %e, "typing stop broadcast failed during disconnect");
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Dispatch one post-auth event. Updates the connection's activity clock
    /// on success; failures are reported to the sender only.
    pub async fn dispatch(
        &self,
        handle: &ConnectionHandle,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        let result = match event {
            ClientEvent::Auth { .. } => Err(GatewayError::validation(
                "already_authenticated",
                "connection is already authenticated",
            )),
            ClientEvent::Chat {
                channel_id,
                content,
                thread_id,
            } => self.handle_chat(handle, channel_id, content, thread_id).await,
            ClientEvent::Typing {
                channel_id,
                is_typing,
            } => self.handle_typing(handle, channel_id, is_typing).await,
        };
        if result.is_ok() {
            self.presence.touch(&handle.id);
        }
        result
    }

    fn check_rate(&self, user_id: UserId) -> Result<(), GatewayError> {
        let decision = self.limiter.check(user_id);
        if decision.allowed {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                retry_after: decision.retry_after.unwrap_or_default(),
            })
        }
    }

    async fn handle_chat(
        &self,
        handle: &ConnectionHandle,
        channel_id: ChannelId,
        content: String,
        thread_id: Option<ThreadId>,
    ) -> Result<(), GatewayError> {
        self.check_rate(handle.user_id)?;
        if content.trim().is_empty() {
            return Err(GatewayError::validation(
                "empty_message",
                "message content is empty",
            ));
        }
        if content.len() > self.config.max_message_bytes {
            return Err(GatewayError::validation(
                "message_too_long",
                format!("message exceeds {} bytes", self.config.max_message_bytes),
            ));
        }

        // Actually sending ends the composing indicator; no stop event is
        // broadcast because the chat broadcast itself supersedes it.
        let _ = self.typing.clear(TypingKey {
            workspace_id: handle.workspace_id,
            channel_id,
            user_id: handle.user_id,
        });

        let message = self
            .store
            .persist(NewMessage {
                workspace_id: handle.workspace_id,
                channel_id,
                sender_id: handle.user_id,
                content,
                thread_id,
            })
            .await
            .map_err(|e| {
                warn!(conn_id = %handle.id, error = %e, "message persistence failed");
                GatewayError::downstream(e.to_string())
            })?;

        counter!(CHAT_MESSAGES_TOTAL).increment(1);
        self.router
            .broadcast_workspace(handle.workspace_id, &ServerEvent::Chat(message));
        Ok(())
    }

    async fn handle_typing(
        &self,
        handle: &ConnectionHandle,
        channel_id: ChannelId,
        is_typing: bool,
    ) -> Result<(), GatewayError> {
        self.check_rate(handle.user_id)?;
        let key = TypingKey {
            workspace_id: handle.workspace_id,
            channel_id,
            user_id: handle.user_id,
        };
        if is_typing {
            if self.typing.signal(key) {
                counter!(TYPING_BURSTS_TOTAL).increment(1);
                self.broadcast_typing(key, true).await?;
            }
        } else if self.typing.clear(key) {
            self.broadcast_typing(key, false).await?;
        }
        Ok(())
    }

    async fn broadcast_typing(&self, key: TypingKey, is_typing: bool) -> Result<(), GatewayError> {
        let members = self
            .directory
            .channel_members(key.workspace_id, key.channel_id)
            .await
            .map_err(|e| GatewayError::downstream(e.to_string()))?;
        self.router.broadcast_users(
            key.workspace_id,
            &members,
            &ServerEvent::Typing {
                channel_id: key.channel_id,
                user_id: key.user_id,
                is_typing,
            },
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background maintenance
    // ─────────────────────────────────────────────────────────────────────

    fn sweep_idle(&self) {
        for connection_id in self.presence.idle_connections(self.config.idle_timeout()) {
            if let Some(handle) = self.router.get(&connection_id) {
                info!(conn_id = %connection_id, "closing idle connection");
                counter!(IDLE_SWEEP_CLOSES_TOTAL).increment(1);
                handle.close(CloseIntent::inactive());
            }
        }
        self.limiter.sweep();
    }

    // ─────────────────────────────────────────────────────────────────────
    // REST-side publish API
    // ─────────────────────────────────────────────────────────────────────

    /// Fan a server-originated event (hub created, member lifecycle,
    /// room presence) out to a workspace.
    pub fn publish_to_workspace(&self, workspace_id: WorkspaceId, event: &ServerEvent) {
        self.router.broadcast_workspace(workspace_id, event);
    }

    /// Fan a server-originated event out to a channel's members.
    pub async fn publish_to_channel(
        &self,
        workspace_id: WorkspaceId,
        channel_id: ChannelId,
        event: &ServerEvent,
    ) -> Result<(), GatewayError> {
        let members = self
            .directory
            .channel_members(workspace_id, channel_id)
            .await
            .map_err(|e| GatewayError::downstream(e.to_string()))?;
        self.router.broadcast_users(workspace_id, &members, event);
        Ok(())
    }
}

/// Drain typing expiries into `typing: false` broadcasts.
async fn drain_typing_expiries(
    gateway: Arc<Gateway>,
    mut expired: mpsc::UnboundedReceiver<TypingKey>,
) {
    while let Some(key) = expired.recv().await {
        // A fresh burst may have started after this expiry was queued; its
        // own timer owns the stop event then.
        if gateway.typing.is_active(key) {
            continue;
        }
        if let Err(e) = gateway.broadcast_typing(key, false).await {
            warn!(error = %e, "typing stop broadcast failed");
        }
    }
}
