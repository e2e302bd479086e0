//! Shared wire types for the voice relay signaling protocol.
//!
//! The relay and its peers exchange JSON events over a persistent
//! bidirectional channel. Every frame is an envelope of the form
//! `{"event": "<kebab-name>", "data": {...}}`; this crate owns the typed
//! representation of both directions plus the identifiers and identity
//! records they carry.

#![warn(clippy::pedantic)]

pub mod events;
pub mod identity;
pub mod ids;

pub use events::{CallType, ChatMessage, ClientEvent, EndReason, NegotiationKind, ServerEvent};
pub use identity::Identity;
pub use ids::{CallId, ConnectionId, RoomId, UserId};
