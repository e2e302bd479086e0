//! The event-tagged JSON wire protocol.
//!
//! Frames are adjacently tagged: `{"event": "call-user", "data": {...}}`.
//! Event names are kebab-case, payload fields camelCase, matching what the
//! original deployment's peers already speak. [`ClientEvent`] flows
//! peer→relay, [`ServerEvent`] relay→peer.
//!
//! Negotiation payloads (`offer`, `answer`, `ice-candidate`) are opaque
//! [`serde_json::Value`]s: the relay never inspects or transforms them.

use crate::identity::Identity;
use crate::ids::{CallId, ConnectionId, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Media flavor of a call, chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

/// The three halves of a media negotiation exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationKind {
    Offer,
    Answer,
    IceCandidate,
}

impl NegotiationKind {
    /// Wire name, for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NegotiationKind::Offer => "offer",
            NegotiationKind::Answer => "answer",
            NegotiationKind::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for NegotiationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// A party ended the call explicitly.
    Ended,
    /// The callee declined.
    Rejected,
    /// A party's transport dropped while the call was live.
    PeerDisconnected,
    /// Nobody answered within the ring timeout.
    RingTimeout,
}

impl EndReason {
    /// Wire name, for logging and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Rejected => "rejected",
            EndReason::PeerDisconnected => "peer-disconnected",
            EndReason::RingTimeout => "ring-timeout",
        }
    }
}

/// A chat message fanned out to a room (`new-message`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Relay-assigned message ID.
    pub id: Uuid,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    /// Free-form type tag; defaults to `"text"`.
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Default message type when `send-message` omits one.
#[must_use]
pub fn default_message_type() -> String {
    "text".to_string()
}

/// Events a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Create or replace this connection's identity.
    #[serde(rename_all = "camelCase")]
    Register {
        user_id: UserId,
        display_name: String,
        email: String,
    },

    /// Join a room (created on first join).
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId, user_id: UserId },

    /// Leave a room. Removal is keyed by connection; `userId` is
    /// accepted for wire compatibility but ignored.
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        room_id: RoomId,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    /// Send a chat message to a room.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        message: String,
        #[serde(default = "default_message_type")]
        message_type: String,
    },

    /// Initiate a call to a registered user.
    #[serde(rename_all = "camelCase")]
    CallUser {
        target_user_id: UserId,
        call_type: CallType,
    },

    /// Accept an incoming call.
    #[serde(rename_all = "camelCase")]
    AcceptCall {
        call_id: CallId,
        /// Legacy counterparty hint; the relay resolves the counterparty
        /// from its own call record.
        #[serde(default)]
        target_socket_id: Option<ConnectionId>,
    },

    /// Reject an incoming call.
    #[serde(rename_all = "camelCase")]
    RejectCall {
        call_id: CallId,
        #[serde(default)]
        target_socket_id: Option<ConnectionId>,
    },

    /// End a call from any non-terminal state.
    #[serde(rename_all = "camelCase")]
    EndCall {
        call_id: CallId,
        #[serde(default)]
        target_socket_id: Option<ConnectionId>,
    },

    /// Report that the local media engine established the path.
    /// Diagnostics only; the relay stays authoritative for terminal-ness.
    #[serde(rename_all = "camelCase")]
    CallConnected { call_id: CallId },

    /// Relay an opaque session-description offer.
    #[serde(rename_all = "camelCase")]
    Offer { target: ConnectionId, payload: Value },

    /// Relay an opaque session-description answer.
    #[serde(rename_all = "camelCase")]
    Answer { target: ConnectionId, payload: Value },

    /// Relay an opaque connectivity candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate { target: ConnectionId, payload: Value },
}

impl ClientEvent {
    /// Wire event name, for logging and error reporting.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register { .. } => "register",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::CallUser { .. } => "call-user",
            ClientEvent::AcceptCall { .. } => "accept-call",
            ClientEvent::RejectCall { .. } => "reject-call",
            ClientEvent::EndCall { .. } => "end-call",
            ClientEvent::CallConnected { .. } => "call-connected",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Events the relay sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Presence snapshot, sent to a peer right after registration.
    UsersList(Vec<Identity>),

    /// A user registered (broadcast to everyone else).
    UserOnline(Identity),

    /// A user's connection dropped (broadcast to everyone else).
    UserOffline(Identity),

    /// Ack to the joiner with the room's member snapshot.
    #[serde(rename_all = "camelCase")]
    JoinedRoom {
        room_id: RoomId,
        members: Vec<Identity>,
    },

    /// Broadcast to a room when a member joins.
    #[serde(rename_all = "camelCase")]
    UserJoined { user: Identity, room_id: RoomId },

    /// Broadcast to a room when a member leaves.
    #[serde(rename_all = "camelCase")]
    UserLeft { user: Identity, room_id: RoomId },

    /// Chat fan-out to a room, sender included.
    NewMessage(ChatMessage),

    /// Invitation delivered to the callee.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: CallId,
        caller: Identity,
        call_type: CallType,
    },

    /// Ack to the caller with the fresh call ID.
    #[serde(rename_all = "camelCase")]
    CallInitiated {
        call_id: CallId,
        target_user: Identity,
    },

    /// The callee accepted; negotiation may begin.
    #[serde(rename_all = "camelCase")]
    CallAccepted { call_id: CallId, actor: Identity },

    /// The callee declined.
    #[serde(rename_all = "camelCase")]
    CallRejected { call_id: CallId, actor: Identity },

    /// The call reached a terminal state. `actor` is absent when the
    /// relay itself terminated the call (timeout, disconnect sweep).
    #[serde(rename_all = "camelCase")]
    CallEnded {
        call_id: CallId,
        #[serde(default)]
        actor: Option<Identity>,
        reason: EndReason,
    },

    /// Relayed session-description offer.
    #[serde(rename_all = "camelCase")]
    Offer { from: ConnectionId, payload: Value },

    /// Relayed session-description answer.
    #[serde(rename_all = "camelCase")]
    Answer { from: ConnectionId, payload: Value },

    /// Relayed connectivity candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate { from: ConnectionId, payload: Value },

    /// Non-fatal error notice, delivered only to the offending connection.
    Error { message: String },
}

impl ServerEvent {
    /// Wire event name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::UsersList(_) => "users-list",
            ServerEvent::UserOnline(_) => "user-online",
            ServerEvent::UserOffline(_) => "user-offline",
            ServerEvent::JoinedRoom { .. } => "joined-room",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::IncomingCall { .. } => "incoming-call",
            ServerEvent::CallInitiated { .. } => "call-initiated",
            ServerEvent::CallAccepted { .. } => "call-accepted",
            ServerEvent::CallRejected { .. } => "call-rejected",
            ServerEvent::CallEnded { .. } => "call-ended",
            ServerEvent::Offer { .. } => "offer",
            ServerEvent::Answer { .. } => "answer",
            ServerEvent::IceCandidate { .. } => "ice-candidate",
            ServerEvent::Error { .. } => "error",
        }
    }
}
