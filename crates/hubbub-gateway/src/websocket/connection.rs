//! Upgrade handler and per-connection event loop.
//!
//! Upgrade-time `workspace_id`/`user_id` query parameters are claims, not
//! grants: identity is trusted only after the first frame's `auth` credential
//! verifies. Nothing is buffered pre-auth; the first frame either
//! authenticates the connection or ends it.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubbub_core::errors::GatewayError;
use hubbub_core::events::{
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, ClientEvent, DecodeError, decode_client_event,
};
use hubbub_core::ids::{UserId, WorkspaceId};

use crate::broadcast::{CloseIntent, ConnectionHandle};
use crate::gateway::Gateway;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::websocket::session::ConnectionContext;

/// Close code for failures the gateway cannot attribute to the client
/// (collaborator outage during auth). Clients treat it as abnormal and retry.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Required upgrade-time query parameters. Non-numeric values fail extraction
/// and the upgrade is rejected with 400 before a socket exists.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Claimed workspace.
    pub workspace_id: u64,
    /// Claimed user; verified against the auth credential's subject.
    pub user_id: u64,
}

/// `GET /ws` upgrade handler.
pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(Query(query)) = query else {
        return (
            StatusCode::BAD_REQUEST,
            "workspace_id and user_id are required numeric query parameters",
        )
            .into_response();
    };
    let workspace_id = WorkspaceId::new(query.workspace_id);
    let user_id = UserId::new(query.user_id);
    ws.on_upgrade(move |socket| handle_socket(gateway, socket, workspace_id, user_id))
}

async fn handle_socket(
    gateway: Arc<Gateway>,
    socket: WebSocket,
    workspace_id: WorkspaceId,
    user_id: UserId,
) {
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let opened_at = Instant::now();

    let mut context = ConnectionContext::new(workspace_id, user_id);
    let (mut sink, mut stream) = socket.split();
    let reason = run_connection(&gateway, &mut context, &mut sink, &mut stream).await;

    // Converging cleanup: a no-op unless the connection authenticated, and a
    // no-op again if another close path already ran it.
    context.close();
    gateway.disconnect(&context.id).await;

    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(opened_at.elapsed().as_secs_f64());
    debug!(conn_id = %context.id, reason, "connection finished");
}

async fn run_connection(
    gateway: &Arc<Gateway>,
    context: &mut ConnectionContext,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> &'static str {
    if let Err(reason) = await_auth(gateway, context, sink, stream).await {
        return reason;
    }

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Arc<str>>(gateway.config().send_queue_capacity);
    let cancel = CancellationToken::new();
    let handle = Arc::new(ConnectionHandle::new(
        context.id.clone(),
        context.workspace_id,
        context.user_id,
        outbound_tx,
        cancel.clone(),
    ));
    gateway.on_authenticated(&handle);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let intent = handle
                    .close_intent()
                    .unwrap_or(CloseIntent { code: CLOSE_NORMAL, reason: "closed" });
                close_with(sink, intent.code, intent.reason).await;
                break intent.reason;
            }

            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(Utf8Bytes::from(&*frame))).await.is_err() {
                        break "transport_error";
                    }
                }
                None => break "shutdown",
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(gateway, &handle, &text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let err = GatewayError::validation(
                        "bad_request",
                        "binary frames are not supported",
                    );
                    let _ = handle.send_event(&err.to_event());
                }
                // Liveness only; pings are answered underneath and do not
                // count as activity.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break "client_closed",
                Some(Err(e)) => {
                    debug!(conn_id = %context.id, error = %e, "websocket error");
                    break "transport_error";
                }
            },
        }
    }
}

/// Decode and dispatch one post-auth frame. All failures are reported to this
/// connection only; none of them close it.
async fn handle_frame(gateway: &Arc<Gateway>, handle: &Arc<ConnectionHandle>, text: &str) {
    match decode_client_event(text) {
        Ok(event) => {
            if let Err(err) = gateway.dispatch(handle, event).await {
                let _ = handle.send_event(&err.to_event());
            }
        }
        Err(decode_err) => {
            let err = decode_to_error(&decode_err);
            let _ = handle.send_event(&err.to_event());
        }
    }
}

fn decode_to_error(decode_err: &DecodeError) -> GatewayError {
    match decode_err {
        DecodeError::Malformed => {
            GatewayError::validation("bad_request", "event does not parse as {type, payload}")
        }
        DecodeError::UnknownType(kind) => {
            GatewayError::validation("unknown_type", format!("unrecognized event type `{kind}`"))
        }
        DecodeError::InvalidPayload(tag) => {
            GatewayError::validation("bad_request", format!("invalid `{tag}` payload"))
        }
    }
}

/// Run the auth handshake: the first meaningful frame must be a verifying
/// `auth` event. Every failure sends a final `error` event, closes, and
/// reports the close reason.
async fn await_auth(
    gateway: &Arc<Gateway>,
    context: &mut ConnectionContext,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<(), &'static str> {
    let deadline = gateway.config().auth_deadline();
    loop {
        let frame = match timeout(deadline, stream.next()).await {
            Err(_) => {
                reject(sink, &GatewayError::auth_required(), "auth deadline exceeded").await;
                return Err("auth_timeout");
            }
            Ok(None) => return Err("client_closed"),
            Ok(Some(Err(e))) => {
                debug!(conn_id = %context.id, error = %e, "websocket error before auth");
                return Err("transport_error");
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                return match decode_client_event(&text) {
                    Ok(ClientEvent::Auth { token }) => {
                        finish_auth(gateway, context, sink, &token).await
                    }
                    Ok(other) => {
                        // The gateway never buffers pre-auth traffic.
                        warn!(conn_id = %context.id, event = other.tag(), "pre-auth traffic rejected");
                        reject(sink, &GatewayError::auth_required(), "authenticate first").await;
                        Err("pre_auth_traffic")
                    }
                    Err(_) => {
                        reject(
                            sink,
                            &GatewayError::validation("bad_request", "malformed auth event"),
                            "malformed auth event",
                        )
                        .await;
                        Err("bad_auth_frame")
                    }
                };
            }
            Message::Binary(_) => {
                reject(
                    sink,
                    &GatewayError::validation("bad_request", "expected a text auth event"),
                    "expected text frame",
                )
                .await;
                return Err("bad_auth_frame");
            }
            // Not auth traffic; keep waiting within the deadline.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return Err("client_closed"),
        }
    }
}

async fn finish_auth(
    gateway: &Arc<Gateway>,
    context: &mut ConnectionContext,
    sink: &mut WsSink,
    token: &str,
) -> Result<(), &'static str> {
    match gateway
        .authenticate(context.workspace_id, context.user_id, token)
        .await
    {
        Ok(role) => {
            debug!(conn_id = %context.id, ?role, "credential verified");
            context
                .authenticate()
                .map_err(|_| "state_error")
        }
        Err(err) if err.is_fatal() => {
            send_error(sink, &err).await;
            close_with(
                sink,
                err.close_code().unwrap_or(CLOSE_POLICY_VIOLATION),
                "authentication failed",
            )
            .await;
            Err("auth_failed")
        }
        Err(err) => {
            // Collaborator outage: the handshake cannot complete, but the
            // client's credential may be fine. Close abnormally so a
            // well-behaved client retries later.
            send_error(sink, &err).await;
            close_with(sink, CLOSE_INTERNAL_ERROR, "retry later").await;
            Err("auth_unavailable")
        }
    }
}

/// Send a final `error` event and close with the policy-violation code.
async fn reject(sink: &mut WsSink, err: &GatewayError, reason: &'static str) {
    send_error(sink, err).await;
    close_with(sink, CLOSE_POLICY_VIOLATION, reason).await;
}

async fn send_error(sink: &mut WsSink, err: &GatewayError) {
    if let Ok(json) = serde_json::to_string(&err.to_event()) {
        let _ = sink.send(Message::Text(Utf8Bytes::from(json))).await;
    }
}

async fn close_with(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}
