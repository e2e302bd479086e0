//! Registered identity records.

use crate::ids::{ConnectionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered identity: one user on one live connection.
///
/// Owned by the relay's connection registry; exists only while the
/// connection is open. Broadcast in presence events (`users-list`,
/// `user-online`, `user-offline`) and carried inside call notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Relay-assigned connection ID (the wire's socket ID).
    pub connection_id: ConnectionId,
    /// Application user ID supplied at registration.
    pub user_id: UserId,
    /// Display name supplied at registration.
    pub display_name: String,
    /// Contact email supplied at registration.
    pub email: String,
    /// When this identity was registered.
    pub registered_at: DateTime<Utc>,
}

impl Identity {
    /// Create an identity registered now.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        email: String,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            display_name,
            email,
            registered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_json_uses_camel_case() {
        let identity = Identity::new(
            ConnectionId::new(),
            UserId::from("alice"),
            "Alice".to_string(),
            "alice@example.com".to_string(),
        );

        let value = serde_json::to_value(&identity).unwrap();
        assert!(value.get("connectionId").is_some());
        assert!(value.get("userId").is_some());
        assert!(value.get("displayName").is_some());
        assert!(value.get("registeredAt").is_some());
        assert_eq!(value["userId"], "alice");
    }

    #[test]
    fn test_identity_round_trip() {
        let identity = Identity::new(
            ConnectionId::new(),
            UserId::from("bob"),
            "Bob".to_string(),
            "bob@example.com".to_string(),
        );

        let json = serde_json::to_string(&identity).unwrap();
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(identity, back);
    }
}
