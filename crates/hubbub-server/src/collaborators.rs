//! HTTP-backed collaborator implementations.
//!
//! The gateway fronts the CRUD backend: membership, persistence and
//! magic-link issuance are internal HTTP calls against it. One
//! [`BackendClient`] implements all three collaborator traits.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use hubbub_core::events::MemberRole;
use hubbub_core::ids::{ChannelId, UserId, WorkspaceId};
use hubbub_core::message::{CanonicalMessage, NewMessage};
use hubbub_gateway::auth::{
    DirectoryError, IssueError, MagicLinkIssuer, MembershipDirectory, MessageStore, StoreError,
};

/// Client for the CRUD backend's internal API.
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
}

impl BackendClient {
    /// Build a client over the backend base URL (no trailing slash).
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            let _ = base.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoleResponse {
    role: MemberRole,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersResponse {
    members: Vec<u64>,
}

#[async_trait]
impl MembershipDirectory for BackendClient {
    async fn role_in_workspace(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Result<Option<MemberRole>, DirectoryError> {
        let url = format!(
            "{}/internal/workspaces/{workspace_id}/members/{user_id}",
            self.base
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: RoleResponse = response
                    .json()
                    .await
                    .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
                Ok(Some(body.role))
            }
            status => Err(DirectoryError::Unavailable(format!(
                "membership lookup returned {status}"
            ))),
        }
    }

    async fn channel_members(
        &self,
        workspace_id: WorkspaceId,
        channel_id: ChannelId,
    ) -> Result<Vec<UserId>, DirectoryError> {
        let url = format!(
            "{}/internal/workspaces/{workspace_id}/channels/{channel_id}/members",
            self.base
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "channel members lookup returned {}",
                response.status()
            )));
        }
        let body: MembersResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(body.members.into_iter().map(UserId::new).collect())
    }
}

#[async_trait]
impl MessageStore for BackendClient {
    async fn persist(&self, message: NewMessage) -> Result<CanonicalMessage, StoreError> {
        let url = format!("{}/internal/messages", self.base);
        let body = json!({
            "workspaceId": message.workspace_id,
            "channelId": message.channel_id,
            "senderId": message.sender_id,
            "content": message.content,
            "threadId": message.thread_id,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        } else if status.is_client_error() {
            Err(StoreError::Rejected(format!("backend returned {status}")))
        } else {
            Err(StoreError::Unavailable(format!(
                "backend returned {status}"
            )))
        }
    }
}

#[async_trait]
impl MagicLinkIssuer for BackendClient {
    async fn issue(&self, email: &str) -> Result<(), IssueError> {
        let url = format!("{}/internal/auth/magic-link", self.base);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(|e| IssueError::Unavailable(e.to_string()))?;
        if response.status().is_success() {
            debug!("magic link requested");
            Ok(())
        } else {
            Err(IssueError::Unavailable(format!(
                "issuer returned {}",
                response.status()
            )))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
