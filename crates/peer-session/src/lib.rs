//! Voice Relay Client Session Library
//!
//! Client-side counterpart of the signaling relay: a resilient
//! WebSocket transport with register-on-connect and automatic
//! reconnection, per-category event routing, and a single-writer call
//! state machine that drives a pluggable media engine.
//!
//! # Architecture
//!
//! ```text
//! TransportSession (one task per relay connection, reconnects)
//! └── EventRouter   (presence / rooms / calls / negotiation / errors)
//!       └── CallSession (actor merging commands, relay events,
//!           and MediaEngine notifications into one state machine)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Strictly single-call**: the session holds at most one call;
//!   invitations arriving while busy are auto-declined.
//! - **The relay stays authoritative**: a `call-ended` from the relay
//!   always wins, and stale events naming an old call ID are dropped.
//! - **One release per call**: every terminal path funnels through one
//!   teardown, so the media engine's `release` runs exactly once.
//!
//! # Modules
//!
//! - [`transport`] - WebSocket transport with reconnect and routing
//! - [`call`] - The call state machine actor
//! - [`media`] - The media engine seam
//! - [`errors`] - Session error types

#![warn(clippy::pedantic)]

pub mod call;
pub mod errors;
pub mod media;
pub mod transport;

pub use call::{CallPhase, CallSession, CallSessionHandle};
pub use errors::SessionError;
pub use media::{MediaEngine, MediaError, MediaEvent};
pub use transport::{
    EventRouter, Registration, TransportConfig, TransportHandle, TransportSession,
};
