//! Branded ID newtypes for type safety.
//!
//! Workspaces, users, channels, threads and messages are identified by the
//! relational backend's numeric keys, wrapped in distinct newtypes so a
//! channel id can never be passed where a user id is expected. Connections
//! are gateway-local and get a UUID v7 (time-ordered) string id instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw numeric key.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Return the raw numeric key.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }
    };
}

numeric_id! {
    /// Top-level tenant boundary; channels and rooms live inside exactly one.
    WorkspaceId
}

numeric_id! {
    /// A registered user.
    UserId
}

numeric_id! {
    /// A channel ("hub") within a workspace.
    ChannelId
}

numeric_id! {
    /// A message thread rooted at a parent message.
    ThreadId
}

numeric_id! {
    /// A persisted chat message.
    MessageId
}

/// Gateway-local identifier for one live connection.
///
/// UUID v7 so connection ids sort by creation time in logs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_roundtrip() {
        let id = WorkspaceId::new(7);
        assert_eq!(id.value(), 7);
        assert_eq!(u64::from(id), 7);
        assert_eq!(WorkspaceId::from(7), id);
    }

    #[test]
    fn numeric_id_display() {
        assert_eq!(UserId::new(42).to_string(), "42");
    }

    #[test]
    fn numeric_id_from_str() {
        let id: ChannelId = "19".parse().unwrap();
        assert_eq!(id, ChannelId::new(19));
    }

    #[test]
    fn numeric_id_from_str_rejects_garbage() {
        assert!("nineteen".parse::<ChannelId>().is_err());
        assert!("-3".parse::<UserId>().is_err());
        assert!("".parse::<WorkspaceId>().is_err());
    }

    #[test]
    fn numeric_id_serde_transparent() {
        let json = serde_json::to_string(&UserId::new(5)).unwrap();
        assert_eq!(json, "5");
        let back: UserId = serde_json::from_str("5").unwrap();
        assert_eq!(back, UserId::new(5));
    }

    #[test]
    fn numeric_ids_are_distinct_types() {
        // Compile-time property; the test just documents it.
        fn takes_user(_: UserId) {}
        takes_user(UserId::new(1));
    }

    #[test]
    fn numeric_id_ordering() {
        assert!(MessageId::new(1) < MessageId::new(2));
    }

    #[test]
    fn connection_id_is_uuid_v7() {
        let id = ConnectionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_id_serde_transparent() {
        let id = ConnectionId::from("conn-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conn-1\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn connection_id_hash_and_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let id = ConnectionId::from("same");
        let _ = set.insert(id.clone());
        let _ = set.insert(id);
        assert_eq!(set.len(), 1);
    }
}
