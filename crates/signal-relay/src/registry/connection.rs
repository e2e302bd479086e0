//! `ConnectionRegistry` - maps live connections to registered identities.
//!
//! The registry is the leaf component everything else reads: presence
//! broadcast, room joins, call target resolution, and signaling delivery
//! all resolve through it. Each entry couples an [`Identity`] with the
//! connection's outbound event channel.
//!
//! # Locking discipline
//!
//! One `RwLock` guards the map. No await and no I/O ever happens under
//! the guard; callers collect senders first and send after release.
//!
//! # Duplicate registrations
//!
//! - Same connection registering twice: the newer identity replaces the
//!   older one in place (idempotent per connection, nothing leaks).
//! - Same userId registering from a second connection: the most recent
//!   registration wins and the prior connection's identity is evicted
//!   atomically inside the same write.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use wire_protocol::{ConnectionId, Identity, ServerEvent, UserId};

/// A registered connection: identity plus its outbound channel.
#[derive(Debug, Clone)]
struct Entry {
    identity: Identity,
    sender: mpsc::Sender<ServerEvent>,
}

/// Result of a registration.
#[derive(Debug)]
pub struct RegisterOutcome {
    /// The identity now registered for the connection.
    pub identity: Identity,
    /// Prior identity on the same connection, if this was a re-register.
    pub replaced: Option<Identity>,
    /// Identity evicted from another connection that held the same userId.
    pub evicted: Option<Identity>,
}

/// Registry of live, registered connections.
///
/// Explicitly constructed and dependency-injected; process-scoped
/// lifetime, never ambient global state.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity for a connection.
    ///
    /// Idempotent per connection: a second call replaces the prior
    /// identity without leaking it. If another connection already holds
    /// the same userId, that entry is evicted (most-recent wins) and
    /// returned in the outcome so the caller can notify it.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        email: String,
        sender: mpsc::Sender<ServerEvent>,
    ) -> RegisterOutcome {
        let identity = Identity::new(connection_id, user_id.clone(), display_name, email);

        let mut map = self.inner.write().await;

        let evicted_key = map
            .iter()
            .find(|(id, entry)| **id != connection_id && entry.identity.user_id == user_id)
            .map(|(id, _)| *id);
        let evicted = evicted_key
            .and_then(|id| map.remove(&id))
            .map(|entry| entry.identity);

        let replaced = map
            .insert(
                connection_id,
                Entry {
                    identity: identity.clone(),
                    sender,
                },
            )
            .map(|entry| entry.identity);
        drop(map);

        if let Some(prior) = &evicted {
            warn!(
                target: "relay.registry",
                user_id = %user_id,
                evicted_connection = %prior.connection_id,
                winner_connection = %connection_id,
                "Duplicate userId registration, most recent wins"
            );
        }

        debug!(
            target: "relay.registry",
            connection_id = %connection_id,
            user_id = %user_id,
            re_register = replaced.is_some(),
            "Identity registered"
        );

        RegisterOutcome {
            identity,
            replaced,
            evicted,
        }
    }

    /// Remove the identity for a connection, returning it if present.
    pub async fn unregister(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let removed = self
            .inner
            .write()
            .await
            .remove(connection_id)
            .map(|entry| entry.identity);

        if let Some(identity) = &removed {
            debug!(
                target: "relay.registry",
                connection_id = %connection_id,
                user_id = %identity.user_id,
                "Identity unregistered"
            );
        }

        removed
    }

    /// Resolve a user to its live identity.
    pub async fn find_by_user_id(&self, user_id: &UserId) -> Option<Identity> {
        self.inner
            .read()
            .await
            .values()
            .find(|entry| &entry.identity.user_id == user_id)
            .map(|entry| entry.identity.clone())
    }

    /// The identity registered on a connection, if any.
    pub async fn identity(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.inner
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.identity.clone())
    }

    /// The outbound channel of a connection, if it is registered.
    pub async fn sender(&self, connection_id: &ConnectionId) -> Option<mpsc::Sender<ServerEvent>> {
        self.inner
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.sender.clone())
    }

    /// Snapshot of all registered identities, ordered by registration
    /// time (presence broadcasts are delivered in this order).
    pub async fn snapshot(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self
            .inner
            .read()
            .await
            .values()
            .map(|entry| entry.identity.clone())
            .collect();
        identities.sort_by_key(|identity| identity.registered_at);
        identities
    }

    /// Outbound channels of every registered connection except one
    /// (broadcast fan-out helper).
    pub async fn senders_except(
        &self,
        excluded: &ConnectionId,
    ) -> Vec<mpsc::Sender<ServerEvent>> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id != excluded)
            .map(|(_, entry)| entry.sender.clone())
            .collect()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
