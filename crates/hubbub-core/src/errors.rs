//! Error taxonomy for the realtime gateway.
//!
//! Six classes, mirroring how each failure is handled:
//!
//! - **Transport** — malformed upgrade request, rejected before a connection
//!   object exists; never reaches the wire protocol
//! - **Authentication** — bad/expired/mismatched credential; fatal to the one
//!   connection, never retried automatically with the same credential
//! - **Authorization** — valid credential but not a member; fatal, surfaced
//!   with a distinct code so clients can show permissions UI instead of login
//! - **Validation** — malformed payload, unknown tag, empty content; the
//!   event is dropped and an `error` reply sent, connection stays open
//! - **`RateLimited`** — event dropped with retry-after metadata
//! - **Downstream** — persistence failed; the sender is told and nothing is
//!   broadcast
//!
//! Only authentication and authorization errors terminate a connection, both
//! with the policy-violation close code.

use std::time::Duration;

use thiserror::Error;

use crate::events::{CLOSE_POLICY_VIOLATION, ServerEvent};

/// A failure while handling one connection's traffic.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed upgrade request; rejected before upgrade.
    #[error("invalid upgrade request: {message}")]
    Transport {
        /// What was wrong with the request.
        message: String,
    },

    /// Credential verification failed.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Wire error code (`auth_failed` or `auth_required`).
        code: &'static str,
        /// Human-readable message.
        message: String,
    },

    /// Credential verified but the subject lacks membership.
    #[error("not authorized: {message}")]
    Authorization {
        /// Human-readable message.
        message: String,
    },

    /// Malformed or semantically invalid event payload.
    #[error("invalid event: {message}")]
    Validation {
        /// Wire error code.
        code: &'static str,
        /// Human-readable message.
        message: String,
    },

    /// The sender exceeded their event budget.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long until the next event would be admitted.
        retry_after: Duration,
    },

    /// A collaborator call failed while handling the event.
    #[error("downstream failure: {message}")]
    Downstream {
        /// Human-readable message.
        message: String,
    },
}

impl GatewayError {
    /// Authentication failure (bad, expired or mismatched credential).
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            code: "auth_failed",
            message: message.into(),
        }
    }

    /// A non-`auth` event arrived while unauthenticated.
    #[must_use]
    pub fn auth_required() -> Self {
        Self::Authentication {
            code: "auth_required",
            message: "authenticate before sending events".to_owned(),
        }
    }

    /// Membership check failed.
    #[must_use]
    pub fn not_a_member(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Validation failure with a wire code.
    #[must_use]
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Downstream collaborator failure.
    #[must_use]
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::Downstream {
            message: message.into(),
        }
    }

    /// Machine-readable wire code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Transport { .. } => "bad_request",
            Self::Authentication { code, .. } | Self::Validation { code, .. } => code,
            Self::Authorization { .. } => "not_a_member",
            Self::RateLimited { .. } => "rate_limited",
            Self::Downstream { .. } => "message_rejected",
        }
    }

    /// Whether this error terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Authorization { .. }
        )
    }

    /// Close code to use when this error terminates the connection.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        if self.is_fatal() {
            Some(CLOSE_POLICY_VIOLATION)
        } else {
            None
        }
    }

    /// The final `error` event sent to the originating client.
    ///
    /// Broadcasts to other clients never carry error state; this event goes
    /// to one connection only.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_owned(),
            message: self.to_string(),
            retry_after_ms: match self {
                Self::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
                _ => None,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_is_fatal_with_policy_close() {
        let err = GatewayError::authentication("bad token");
        assert!(err.is_fatal());
        assert_eq!(err.close_code(), Some(CLOSE_POLICY_VIOLATION));
        assert_eq!(err.code(), "auth_failed");
    }

    #[test]
    fn auth_required_is_fatal() {
        let err = GatewayError::auth_required();
        assert!(err.is_fatal());
        assert_eq!(err.code(), "auth_required");
    }

    #[test]
    fn authorization_is_fatal_with_distinct_code() {
        let err = GatewayError::not_a_member("user 3 not in workspace 7");
        assert!(err.is_fatal());
        assert_eq!(err.code(), "not_a_member");
        // Distinct from the authentication code so clients can show a
        // permissions message instead of prompting re-login.
        assert_ne!(err.code(), GatewayError::authentication("x").code());
    }

    #[test]
    fn validation_is_not_fatal() {
        let err = GatewayError::validation("empty_message", "content is empty");
        assert!(!err.is_fatal());
        assert_eq!(err.close_code(), None);
        assert_eq!(err.code(), "empty_message");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = GatewayError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert!(!err.is_fatal());
        match err.to_event() {
            ServerEvent::Error {
                code,
                retry_after_ms,
                ..
            } => {
                assert_eq!(code, "rate_limited");
                assert_eq!(retry_after_ms, Some(1500));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn downstream_is_not_fatal() {
        let err = GatewayError::downstream("store unavailable");
        assert!(!err.is_fatal());
        assert_eq!(err.code(), "message_rejected");
    }

    #[test]
    fn to_event_has_code_and_message() {
        let err = GatewayError::authentication("token expired");
        match err.to_event() {
            ServerEvent::Error { code, message, .. } => {
                assert_eq!(code, "auth_failed");
                assert!(message.contains("token expired"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn fatal_events_are_recognized_by_clients() {
        assert!(GatewayError::authentication("x").to_event().is_auth_error());
        assert!(GatewayError::auth_required().to_event().is_auth_error());
        assert!(GatewayError::not_a_member("x").to_event().is_auth_error());
        assert!(
            !GatewayError::validation("bad_request", "x")
                .to_event()
                .is_auth_error()
        );
    }

    #[test]
    fn transport_maps_to_bad_request() {
        let err = GatewayError::Transport {
            message: "workspace_id must be numeric".into(),
        };
        assert_eq!(err.code(), "bad_request");
        assert!(!err.is_fatal());
    }
}
