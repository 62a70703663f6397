//! Canonical chat message model.
//!
//! The persistence collaborator owns message identity and timestamps; the
//! gateway never invents either. A [`CanonicalMessage`] is what comes back
//! from a successful persist and is broadcast verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, MessageId, ThreadId, UserId, WorkspaceId};

/// A chat message as persisted, with backend-assigned id and timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Backend-assigned message id.
    pub id: MessageId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Channel the message was posted to.
    pub channel_id: ChannelId,
    /// Author.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Parent thread, if posted in a thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    /// Backend-assigned creation time.
    pub created_at: DateTime<Utc>,
}

/// A validated chat-send request handed to the persistence collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Target channel.
    pub channel_id: ChannelId,
    /// Author.
    pub sender_id: UserId,
    /// Message body (already validated non-empty and within size bounds).
    pub content: String,
    /// Parent thread, if replying in a thread.
    pub thread_id: Option<ThreadId>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_message_wire_shape() {
        let message = CanonicalMessage {
            id: MessageId::new(12),
            workspace_id: WorkspaceId::new(7),
            channel_id: ChannelId::new(1),
            sender_id: UserId::new(3),
            content: "hi".into(),
            thread_id: Some(ThreadId::new(9)),
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["id"], 12);
        assert_eq!(value["workspaceId"], 7);
        assert_eq!(value["channelId"], 1);
        assert_eq!(value["senderId"], 3);
        assert_eq!(value["threadId"], 9);
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn canonical_message_thread_omitted_when_none() {
        let message = CanonicalMessage {
            id: MessageId::new(12),
            workspace_id: WorkspaceId::new(7),
            channel_id: ChannelId::new(1),
            sender_id: UserId::new(3),
            content: "hi".into(),
            thread_id: None,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("threadId").is_none());
    }

    #[test]
    fn canonical_message_roundtrip() {
        let message = CanonicalMessage {
            id: MessageId::new(1),
            workspace_id: WorkspaceId::new(2),
            channel_id: ChannelId::new(3),
            sender_id: UserId::new(4),
            content: "round trip".into(),
            thread_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap(),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: CanonicalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
