//! Wire protocol for the realtime gateway.
//!
//! Every frame in both directions is a JSON envelope `{ "type": string,
//! "payload": object }`. Events are modeled as tagged unions so dispatch is an
//! exhaustive match: adding an event kind is a compile-time-checked change,
//! not a string comparison. Member-lifecycle events carry their fields inside
//! `payload` like every other event.
//!
//! Payload field names are camelCase on the wire, matching the REST backend's
//! JSON conventions.

use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, ThreadId, UserId, WorkspaceId};
use crate::message::CanonicalMessage;

// ─────────────────────────────────────────────────────────────────────────────
// Close codes
// ─────────────────────────────────────────────────────────────────────────────

/// Normal closure: logout, navigation, idle timeout.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (browser tab closed). Treated like normal closure.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation: auth failure, membership failure, pre-auth traffic.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close reason attached to idle-timeout closes.
pub const CLOSE_REASON_INACTIVE: &str = "inactive";

/// Whether a close code is one of the two clean-closure codes.
///
/// Clients must not reconnect after a clean closure.
#[must_use]
pub const fn is_clean_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → server events
// ─────────────────────────────────────────────────────────────────────────────

/// Events a client may send to the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bearer-credential handshake; must be the first event on a connection.
    Auth {
        /// The bearer token issued by the auth service.
        token: String,
    },

    /// Send a chat message to a channel.
    #[serde(rename_all = "camelCase")]
    Chat {
        /// Target channel.
        channel_id: ChannelId,
        /// Message body.
        content: String,
        /// Parent thread, if replying in a thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
    },

    /// The user started or stopped composing in a channel.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Channel being composed in.
        channel_id: ChannelId,
        /// `true` while composing; `false` is an explicit stop.
        is_typing: bool,
    },
}

impl ClientEvent {
    /// Wire tag for this event.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Chat { .. } => "chat",
            Self::Typing { .. } => "typing",
        }
    }
}

/// The set of tags [`ClientEvent`] can decode.
const CLIENT_EVENT_TAGS: [&str; 3] = ["auth", "chat", "typing"];

/// Bare envelope used to classify frames that fail full decoding.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Why an inbound frame could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, or not a `{type, payload}` envelope.
    Malformed,
    /// Valid envelope, but a tag the gateway does not know.
    UnknownType(String),
    /// Known tag, but the payload does not match its schema.
    InvalidPayload(&'static str),
}

/// Decode a client frame, classifying failures.
///
/// Distinguishes a malformed envelope from an unknown tag from a bad payload
/// so the gateway can answer with a precise error code instead of a generic
/// parse failure.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, DecodeError> {
    if let Ok(event) = serde_json::from_str::<ClientEvent>(text) {
        return Ok(event);
    }
    let Ok(envelope) = serde_json::from_str::<RawEnvelope>(text) else {
        return Err(DecodeError::Malformed);
    };
    match CLIENT_EVENT_TAGS.iter().copied().find(|t| *t == envelope.kind) {
        Some(tag) => Err(DecodeError::InvalidPayload(tag)),
        None => Err(DecodeError::UnknownType(envelope.kind)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client events
// ─────────────────────────────────────────────────────────────────────────────

/// Presence status carried by a `presence` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// At least one live authenticated connection.
    Online,
    /// No live connection remains.
    Offline,
    /// Online and currently in a room.
    InRoom,
}

/// Membership role within a workspace or hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Workspace/hub owner.
    Owner,
    /// Administrator.
    Admin,
    /// Regular member.
    Member,
}

/// Summary of a newly created hub, broadcast to workspace members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSummary {
    /// Hub id.
    pub id: ChannelId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Display name.
    pub name: String,
    /// Creator.
    pub created_by: UserId,
}

/// Events the gateway fans out to clients.
///
/// A broadcast serializes the event once and sends the same encoded payload
/// to every matching connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A persisted chat message; the payload is the canonical message.
    Chat(CanonicalMessage),

    /// A user started or stopped composing in a channel.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Channel being composed in.
        channel_id: ChannelId,
        /// Composing user.
        user_id: UserId,
        /// `true` on burst start, `false` on expiry.
        is_typing: bool,
    },

    /// A user's presence in the workspace changed.
    #[serde(rename_all = "camelCase")]
    Presence {
        /// Affected user.
        user_id: UserId,
        /// New status.
        status: PresenceStatus,
        /// Free-form status line, if the user set one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_status: Option<String>,
    },

    /// Snapshot of everyone online in the workspace; sent once per successful
    /// auth, before any other broadcast reaches the new connection.
    #[serde(rename_all = "camelCase")]
    PresenceSync {
        /// Deduplicated ids of currently online users.
        online_users: Vec<UserId>,
    },

    /// An error concerning the receiving connection only.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// For rate-limit errors: how long to back off.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// A hub was created in the workspace.
    HubCreated(HubSummary),

    /// A user was added to a hub.
    #[serde(rename_all = "camelCase")]
    MemberAdded {
        /// Hub the user was added to.
        hub_id: ChannelId,
        /// Added user.
        user_id: UserId,
        /// Granted role.
        role: MemberRole,
    },

    /// A user was removed from a hub.
    #[serde(rename_all = "camelCase")]
    MemberRemoved {
        /// Hub the user was removed from.
        hub_id: ChannelId,
        /// Removed user.
        user_id: UserId,
    },

    /// A hub member's role changed.
    #[serde(rename_all = "camelCase")]
    MemberUpdated {
        /// Hub the membership belongs to.
        hub_id: ChannelId,
        /// Affected user.
        user_id: UserId,
        /// New role.
        role: MemberRole,
    },
}

impl ServerEvent {
    /// Wire tag for this event.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::PresenceSync { .. } => "presence_sync",
            Self::Error { .. } => "error",
            Self::HubCreated(_) => "hub_created",
            Self::MemberAdded { .. } => "member_added",
            Self::MemberRemoved { .. } => "member_removed",
            Self::MemberUpdated { .. } => "member_updated",
        }
    }

    /// Whether this is an `error` event with an authentication or
    /// authorization code. Clients treat these as fatal for the connection.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Error { code, .. } => {
                matches!(code.as_str(), "auth_failed" | "auth_required" | "not_a_member")
            }
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::ids::MessageId;

    fn sample_message() -> CanonicalMessage {
        CanonicalMessage {
            id: MessageId::new(99),
            workspace_id: WorkspaceId::new(7),
            channel_id: ChannelId::new(1),
            sender_id: UserId::new(3),
            content: "hi".to_owned(),
            thread_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap(),
        }
    }

    // -- envelope shape --

    #[test]
    fn client_auth_envelope_shape() {
        let event = ClientEvent::Auth {
            token: "tok".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["payload"]["token"], "tok");
    }

    #[test]
    fn client_chat_envelope_shape() {
        let event = ClientEvent::Chat {
            channel_id: ChannelId::new(1),
            content: "hello".into(),
            thread_id: Some(ThreadId::new(4)),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["payload"]["channelId"], 1);
        assert_eq!(value["payload"]["content"], "hello");
        assert_eq!(value["payload"]["threadId"], 4);
    }

    #[test]
    fn client_chat_thread_id_omitted_when_none() {
        let event = ClientEvent::Chat {
            channel_id: ChannelId::new(1),
            content: "hello".into(),
            thread_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["payload"].get("threadId").is_none());
    }

    #[test]
    fn client_typing_envelope_shape() {
        let event = ClientEvent::Typing {
            channel_id: ChannelId::new(2),
            is_typing: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "typing");
        assert_eq!(value["payload"]["isTyping"], true);
    }

    #[test]
    fn server_chat_payload_is_canonical_message() {
        let event = ServerEvent::Chat(sample_message());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["payload"]["id"], 99);
        assert_eq!(value["payload"]["senderId"], 3);
        assert_eq!(value["payload"]["content"], "hi");
    }

    #[test]
    fn server_presence_sync_shape() {
        let event = ServerEvent::PresenceSync {
            online_users: vec![UserId::new(3), UserId::new(5)],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "presence_sync");
        assert_eq!(value["payload"]["onlineUsers"], json!([3, 5]));
    }

    #[test]
    fn server_presence_status_wire_names() {
        let event = ServerEvent::Presence {
            user_id: UserId::new(3),
            status: PresenceStatus::InRoom,
            custom_status: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["status"], "in_room");
        assert!(value["payload"].get("customStatus").is_none());
    }

    #[test]
    fn member_events_are_normalized_into_payload() {
        // The source system put these fields at the envelope top level; here
        // they ride in `payload` like every other event.
        let event = ServerEvent::MemberAdded {
            hub_id: ChannelId::new(8),
            user_id: UserId::new(2),
            role: MemberRole::Admin,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "member_added");
        assert_eq!(value["payload"]["hubId"], 8);
        assert_eq!(value["payload"]["userId"], 2);
        assert_eq!(value["payload"]["role"], "admin");
        assert!(value.get("hubId").is_none());
    }

    #[test]
    fn error_event_omits_retry_after_when_absent() {
        let event = ServerEvent::Error {
            code: "bad_request".into(),
            message: "nope".into(),
            retry_after_ms: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["payload"].get("retryAfterMs").is_none());
    }

    #[test]
    fn server_event_roundtrip() {
        let events = vec![
            ServerEvent::Chat(sample_message()),
            ServerEvent::Typing {
                channel_id: ChannelId::new(1),
                user_id: UserId::new(3),
                is_typing: false,
            },
            ServerEvent::Presence {
                user_id: UserId::new(3),
                status: PresenceStatus::Offline,
                custom_status: Some("afk".into()),
            },
            ServerEvent::HubCreated(HubSummary {
                id: ChannelId::new(8),
                workspace_id: WorkspaceId::new(7),
                name: "general".into(),
                created_by: UserId::new(1),
            }),
            ServerEvent::MemberRemoved {
                hub_id: ChannelId::new(8),
                user_id: UserId::new(2),
            },
            ServerEvent::MemberUpdated {
                hub_id: ChannelId::new(8),
                user_id: UserId::new(2),
                role: MemberRole::Member,
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: ServerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    // -- tags --

    #[test]
    fn tags_match_wire_type() {
        let event = ClientEvent::Auth {
            token: "t".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.tag());

        let event = ServerEvent::PresenceSync {
            online_users: vec![],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.tag());
    }

    // -- decode_client_event --

    #[test]
    fn decode_valid_auth() {
        let event =
            decode_client_event(r#"{"type":"auth","payload":{"token":"tok"}}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Auth {
                token: "tok".into()
            }
        );
    }

    #[test]
    fn decode_malformed_json() {
        assert_eq!(decode_client_event("{not json"), Err(DecodeError::Malformed));
    }

    #[test]
    fn decode_missing_type() {
        assert_eq!(
            decode_client_event(r#"{"payload":{}}"#),
            Err(DecodeError::Malformed)
        );
    }

    #[test]
    fn decode_unknown_tag() {
        assert_eq!(
            decode_client_event(r#"{"type":"presence","payload":{}}"#),
            Err(DecodeError::UnknownType("presence".into()))
        );
    }

    #[test]
    fn decode_known_tag_bad_payload() {
        assert_eq!(
            decode_client_event(r#"{"type":"chat","payload":{"content":42}}"#),
            Err(DecodeError::InvalidPayload("chat"))
        );
    }

    // -- close codes --

    #[test]
    fn clean_close_codes() {
        assert!(is_clean_close(CLOSE_NORMAL));
        assert!(is_clean_close(CLOSE_GOING_AWAY));
        assert!(!is_clean_close(CLOSE_POLICY_VIOLATION));
        assert!(!is_clean_close(1011));
    }

    // -- is_auth_error --

    #[test]
    fn auth_error_codes_are_fatal_for_clients() {
        for code in ["auth_failed", "auth_required", "not_a_member"] {
            let event = ServerEvent::Error {
                code: code.into(),
                message: "denied".into(),
                retry_after_ms: None,
            };
            assert!(event.is_auth_error(), "{code} should be fatal");
        }
    }

    #[test]
    fn non_auth_errors_are_not_fatal() {
        let event = ServerEvent::Error {
            code: "rate_limited".into(),
            message: "slow down".into(),
            retry_after_ms: Some(500),
        };
        assert!(!event.is_auth_error());
        assert!(!ServerEvent::PresenceSync {
            online_users: vec![]
        }
        .is_auth_error());
    }
}
