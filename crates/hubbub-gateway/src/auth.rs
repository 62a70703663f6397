//! External collaborator seams and the default credential verifier.
//!
//! The gateway never implements storage: credential verification, membership
//! lookup, message persistence and magic-link issuance are trait objects
//! injected at construction. Production wiring lives in the server binary;
//! tests inject in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use thiserror::Error;

use hubbub_core::events::MemberRole;
use hubbub_core::ids::{ChannelId, UserId, WorkspaceId};
use hubbub_core::message::{CanonicalMessage, NewMessage};

// ─────────────────────────────────────────────────────────────────────────────
// Credential verification
// ─────────────────────────────────────────────────────────────────────────────

/// The decoded identity behind a bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedCredential {
    /// The authenticated user.
    pub subject: UserId,
    /// When the token was issued, if the credential carries it.
    pub issued_at: Option<DateTime<Utc>>,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
}

/// Credential verification failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is malformed, has a bad signature, or an unusable subject.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token verified but is past its expiry.
    #[error("token expired")]
    Expired,
}

/// Verifies bearer credentials presented in `auth` events.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify a token and return the identity it proves.
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, AuthError>;
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    iat: Option<i64>,
    exp: i64,
}

/// HS256 JWT verifier; the default [`CredentialVerifier`].
///
/// Subjects are the numeric user id rendered as a string, matching the tokens
/// the auth service mints for magic-link logins.
pub struct JwtCredentialVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialVerifier {
    /// Build a verifier over a shared HS256 secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl CredentialVerifier for JwtCredentialVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, AuthError> {
        let data = decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        let subject = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::InvalidToken("subject is not a numeric user id".into()))?;
        let expires_at = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidToken("exp out of range".into()))?;
        let issued_at = data
            .claims
            .iat
            .and_then(|iat| Utc.timestamp_opt(iat, 0).single());
        Ok(VerifiedCredential {
            subject,
            issued_at,
            expires_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Membership directory
// ─────────────────────────────────────────────────────────────────────────────

/// Membership lookup failure.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory backend could not answer.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Answers "is this user a member, and of what".
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// The user's role in the workspace, or `None` if not a member.
    async fn role_in_workspace(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
    ) -> Result<Option<MemberRole>, DirectoryError>;

    /// User ids of everyone in the channel.
    async fn channel_members(
        &self,
        workspace_id: WorkspaceId,
        channel_id: ChannelId,
    ) -> Result<Vec<UserId>, DirectoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Message persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store backend could not answer.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Persists chat messages and assigns canonical identity.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a validated message; returns it with id and timestamp.
    async fn persist(&self, message: NewMessage) -> Result<CanonicalMessage, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Magic-link issuance
// ─────────────────────────────────────────────────────────────────────────────

/// Magic-link issuance failure.
#[derive(Debug, Error)]
pub enum IssueError {
    /// The auth backend could not send the link.
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
}

/// Requests a login link for an email address.
///
/// Runs pre-authentication, which is why the route fronting it is limited by
/// client address rather than user id.
#[async_trait]
pub trait MagicLinkIssuer: Send + Sync {
    /// Ask the auth service to email a login link.
    async fn issue(&self, email: &str) -> Result<(), IssueError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
