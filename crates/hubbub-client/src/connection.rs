//! Background connection loop with bounded-backoff reconnect.
//!
//! The loop owns the transport exclusively: one attempt at a time, the dead
//! transport dropped before the next dial, and exactly one `auth` event sent
//! per successful open. Abnormal closes reconnect on the
//! [`ReconnectPolicy`](hubbub_core::retry::ReconnectPolicy) schedule; clean
//! closes and credential rejections stop the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use hubbub_core::events::{ClientEvent, ServerEvent, is_clean_close};
use hubbub_core::ids::{ChannelId, ThreadId};

use crate::types::{ClientConfig, ClientError, ClientNotification, ConnState};

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(ClientEvent),
    Shutdown,
}

/// How one open connection ended.
enum SessionEnd {
    /// Clean close (logout, navigation, idle timeout). No reconnect.
    Clean,
    /// Abnormal close or transport error. Reconnect with backoff.
    Abnormal,
    /// The gateway rejected the credential. Never retried with the same
    /// token.
    AuthRejected,
    /// Local shutdown request.
    Shutdown,
}

/// Handle to the background connection loop.
pub struct RealtimeClient {
    state: Arc<RwLock<ConnState>>,
    command_tx: mpsc::Sender<Command>,
}

impl RealtimeClient {
    /// Spawn the connection loop. Returns the handle and the notification
    /// stream. Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<ClientNotification>) {
        let state = Arc::new(RwLock::new(ConnState::Connecting));
        let (command_tx, command_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(256);
        drop(tokio::spawn(connection_loop(
            config,
            Arc::clone(&state),
            notify_tx,
            command_rx,
        )));
        (Self { state, command_tx }, notify_rx)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    /// Whether sends would currently be accepted.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            ConnState::Open {
                authenticated: true
            }
        )
    }

    /// Send a chat message. Fails locally unless open and authenticated.
    pub fn send_chat(
        &self,
        channel_id: ChannelId,
        content: impl Into<String>,
        thread_id: Option<ThreadId>,
    ) -> Result<(), ClientError> {
        self.send(ClientEvent::Chat {
            channel_id,
            content: content.into(),
            thread_id,
        })
    }

    /// Send a typing signal. Fails locally unless open and authenticated.
    pub fn send_typing(&self, channel_id: ChannelId, is_typing: bool) -> Result<(), ClientError> {
        self.send(ClientEvent::Typing {
            channel_id,
            is_typing,
        })
    }

    fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_authenticated() {
            return Err(ClientError::NotConnected);
        }
        self.command_tx
            .try_send(Command::Send(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
            })
    }

    /// Close cleanly and stop the loop. No reconnect follows.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

async fn connection_loop(
    config: ClientConfig,
    state: Arc<RwLock<ConnState>>,
    notify: mpsc::Sender<ClientNotification>,
    mut commands: mpsc::Receiver<Command>,
) {
    let policy = config.reconnect.clone();
    // Consecutive failed attempts; reset once a connection authenticates.
    let mut attempt: u32 = 0;

    loop {
        *state.write() = ConnState::Connecting;
        let url = config.ws_url();
        debug!(endpoint = %config.endpoint, "dialing gateway");

        let dialed = tokio::time::timeout(
            config.connect_timeout(),
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        match dialed {
            Ok(Ok((connection, _response))) => {
                match drive_connection(
                    &config,
                    &state,
                    &notify,
                    &mut commands,
                    &mut attempt,
                    connection,
                )
                .await
                {
                    SessionEnd::Clean => {
                        *state.write() = ConnState::Idle;
                        let _ = notify
                            .send(ClientNotification::Disconnected { will_retry: false })
                            .await;
                        return;
                    }
                    SessionEnd::AuthRejected | SessionEnd::Shutdown => {
                        *state.write() = ConnState::Idle;
                        return;
                    }
                    SessionEnd::Abnormal => {}
                }
            }
            Ok(Err(e)) => debug!(error = %e, "connect failed"),
            Err(_) => debug!("connect timed out"),
        }
        // The dead transport is fully dropped by here; exactly one attempt is
        // ever in flight.

        attempt += 1;
        let will_retry = policy.allows(attempt);
        let _ = notify
            .send(ClientNotification::Disconnected { will_retry })
            .await;
        if !will_retry {
            warn!(attempt, "reconnect budget exhausted");
            *state.write() = ConnState::Idle;
            let _ = notify.send(ClientNotification::GaveUp).await;
            return;
        }

        *state.write() = ConnState::Reconnecting { attempt };
        let delay = Duration::from_millis(policy.delay_ms(attempt));
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = wait_for_shutdown(&mut commands) => {
                *state.write() = ConnState::Idle;
                return;
            }
        }
    }
}

/// Drain commands while disconnected; resolves on shutdown (or when every
/// handle is gone).
async fn wait_for_shutdown(commands: &mut mpsc::Receiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Shutdown) | None => return,
            // Raced past the state check during teardown; sends are not
            // queued across connections.
            Some(Command::Send(_)) => {}
        }
    }
}

async fn drive_connection(
    config: &ClientConfig,
    state: &Arc<RwLock<ConnState>>,
    notify: &mpsc::Sender<ClientNotification>,
    commands: &mut mpsc::Receiver<Command>,
    attempt: &mut u32,
    connection: WsConnection,
) -> SessionEnd {
    let (mut sink, mut stream) = connection.split();
    *state.write() = ConnState::Open {
        authenticated: false,
    };

    // Authenticate immediately on open: one auth event per reopen.
    let auth = ClientEvent::Auth {
        token: config.token.clone(),
    };
    if !send_event(&mut sink, &auth).await {
        return SessionEnd::Abnormal;
    }
    let _ = notify.send(ClientNotification::Connected).await;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(event)) => {
                    if !send_event(&mut sink, &event).await {
                        return SessionEnd::Abnormal;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })))
                        .await;
                    return SessionEnd::Shutdown;
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if let Some(end) =
                                handle_event(config, state, notify, attempt, &mut sink, event).await
                            {
                                return end;
                            }
                        }
                        Err(e) => {
                            // Unknown event kinds from a newer gateway are
                            // skipped, not fatal.
                            debug!(error = %e, "unrecognized event");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let clean = frame
                        .as_ref()
                        .is_some_and(|f| is_clean_close(u16::from(f.code)));
                    return if clean {
                        SessionEnd::Clean
                    } else {
                        SessionEnd::Abnormal
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket error");
                    return SessionEnd::Abnormal;
                }
                None => return SessionEnd::Abnormal,
            },
        }
    }
}

/// Handle one decoded inbound event; `Some(end)` terminates the session.
async fn handle_event(
    config: &ClientConfig,
    state: &Arc<RwLock<ConnState>>,
    notify: &mpsc::Sender<ClientNotification>,
    attempt: &mut u32,
    sink: &mut futures::stream::SplitSink<WsConnection, WsMessage>,
    event: ServerEvent,
) -> Option<SessionEnd> {
    if event.is_auth_error() {
        let code = match &event {
            ServerEvent::Error { code, .. } => code.clone(),
            _ => String::new(),
        };
        warn!(code, user_id = %config.user_id, "credential rejected, not retrying");
        let _ = notify.send(ClientNotification::AuthRejected { code }).await;
        // Force-close rather than retry with the same, now-presumed-bad
        // credential.
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;
        return Some(SessionEnd::AuthRejected);
    }

    match event {
        // The snapshot doubles as the auth acknowledgement: it is the first
        // thing the gateway sends an accepted connection.
        ServerEvent::PresenceSync { online_users } => {
            *state.write() = ConnState::Open {
                authenticated: true,
            };
            *attempt = 0;
            let _ = notify
                .send(ClientNotification::Authenticated { online_users })
                .await;
        }
        other => {
            let _ = notify.send(ClientNotification::Event(other)).await;
        }
    }
    None
}

/// Encode and send one event; `false` means the transport is dead.
async fn send_event(
    sink: &mut futures::stream::SplitSink<WsConnection, WsMessage>,
    event: &ClientEvent,
) -> bool {
    let Ok(json) = serde_json::to_string(event) else {
        warn!(event = event.tag(), "failed to serialize event");
        return true;
    };
    match sink.send(WsMessage::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "send failed");
            false
        }
    }
}
