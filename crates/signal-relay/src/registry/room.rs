//! `RoomRegistry` - room membership tracking.
//!
//! Rooms are created on first join and deleted when their membership
//! becomes empty. A room's member list never contains the same userId
//! twice; members are removed by connection id, mirroring identity
//! lifetime.
//!
//! All mutations of a room happen under the single write guard, so two
//! operations on the same room are serialized; no await happens under
//! the guard.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use wire_protocol::{ConnectionId, Identity, RoomId};

#[derive(Debug)]
struct Room {
    members: Vec<Identity>,
    #[allow(dead_code)] // Surfaced in diagnostics once room listing exists
    created_at: DateTime<Utc>,
}

/// Registry of active rooms.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity to a room, creating the room if absent.
    ///
    /// Idempotent by userId: joining twice (from any connection) leaves
    /// one entry per distinct userId. Returns the member snapshot after
    /// the join.
    pub async fn join(&self, room_id: RoomId, identity: Identity) -> Vec<Identity> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.clone()).or_insert_with(|| Room {
            members: Vec::new(),
            created_at: Utc::now(),
        });

        if !room
            .members
            .iter()
            .any(|member| member.user_id == identity.user_id)
        {
            room.members.push(identity.clone());
        }

        let snapshot = room.members.clone();
        drop(rooms);

        debug!(
            target: "relay.rooms",
            room_id = %room_id,
            user_id = %identity.user_id,
            members = snapshot.len(),
            "Joined room"
        );

        snapshot
    }

    /// Remove a connection from a room, deleting the room if it becomes
    /// empty. Returns the removed member's identity.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Option<Identity> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;

        let position = room
            .members
            .iter()
            .position(|member| &member.connection_id == connection_id)?;
        let removed = room.members.remove(position);

        let now_empty = room.members.is_empty();
        if now_empty {
            rooms.remove(room_id);
        }
        drop(rooms);

        debug!(
            target: "relay.rooms",
            room_id = %room_id,
            user_id = %removed.user_id,
            room_removed = now_empty,
            "Left room"
        );

        Some(removed)
    }

    /// Member snapshot of a room, if it exists.
    pub async fn members(&self, room_id: &RoomId) -> Option<Vec<Identity>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.members.clone())
    }

    /// Remove a connection from every room it occupies (disconnect
    /// cleanup). Returns `(room, removed identity)` per vacated room.
    pub async fn vacate(&self, connection_id: &ConnectionId) -> Vec<(RoomId, Identity)> {
        let mut vacated = Vec::new();
        let mut rooms = self.rooms.write().await;

        rooms.retain(|room_id, room| {
            if let Some(position) = room
                .members
                .iter()
                .position(|member| &member.connection_id == connection_id)
            {
                let removed = room.members.remove(position);
                vacated.push((room_id.clone(), removed));
            }
            !room.members.is_empty()
        });
        drop(rooms);

        vacated
    }

    /// Number of active rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether no rooms exist.
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}
