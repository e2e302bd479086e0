//! Voice Relay Signaling Server Library
//!
//! This library provides the core functionality for the voice relay - a
//! stateful WebSocket signaling server responsible for:
//!
//! - Live presence tracking (connection registry, online/offline broadcast)
//! - Room membership and room-scoped chat fan-out
//! - Call lifecycle orchestration (the authoritative call state machine)
//! - Opaque negotiation relay (offer / answer / ICE candidate pass-through)
//! - Health and status endpoints for liveness probing
//!
//! # Architecture
//!
//! ```text
//! axum server (one task per WebSocket connection)
//! ├── ConnectionRegistry  (identity per live connection)
//! ├── RoomRegistry        (membership per room)
//! ├── SignalingRelay      (stateless delivery by connection id)
//! └── CallOrchestrator    (single actor owning all call records)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Relay-authoritative calls**: the orchestrator is the single source
//!   of truth for call existence and terminal-ness; a straggling message
//!   from a stale negotiation round can never resurrect an ended call.
//! - **One mailbox per concern**: every call transition goes through the
//!   orchestrator's mailbox, which serializes disconnect cleanup against
//!   explicit accept/reject/end and yields exactly-once termination
//!   notices.
//! - **Errors stay local**: a malformed frame or guard violation produces
//!   one `error` event to the offending connection and nothing else.
//!
//! # Modules
//!
//! - [`calls`] - Call records and the orchestrator actor
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe messages
//! - [`registry`] - Connection and room registries
//! - [`relay`] - Stateless signaling delivery
//! - [`server`] - WebSocket endpoint and per-connection handling
//! - [`observability`] - Health and status endpoints

#![warn(clippy::pedantic)]

pub mod calls;
pub mod config;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod server;
