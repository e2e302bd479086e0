//! The media engine seam.
//!
//! The call state machine owns signaling and call state; everything
//! about actual media (device capture, encode, the transport-level
//! negotiation internals) lives behind [`MediaEngine`]. The engine
//! reports asynchronous outcomes back through [`MediaEvent`]s.
//!
//! Negotiation payloads are opaque [`Value`]s end to end: the engine
//! produces and consumes them, the state machine and the relay only
//! route them.

use serde_json::Value;
use thiserror::Error;
use wire_protocol::{CallId, CallType};

/// A media engine failure. The message is surfaced in logs and in
/// [`crate::errors::SessionError::Media`].
#[derive(Debug, Error)]
#[error("media engine error: {0}")]
pub struct MediaError(pub String);

/// Driver interface for the local media stack.
///
/// Called synchronously from the call state machine's task; long-running
/// work belongs inside the engine, with completion reported via
/// [`MediaEvent`].
pub trait MediaEngine: Send + 'static {
    /// Allocate media resources for a call. `initiator` is true when the
    /// local peer placed the call and will produce the offer.
    fn begin_session(
        &mut self,
        call_id: CallId,
        call_type: CallType,
        initiator: bool,
    ) -> Result<(), MediaError>;

    /// Produce the local session description offer.
    fn create_offer(&mut self, call_id: CallId) -> Result<Value, MediaError>;

    /// Apply the remote offer and produce the local answer.
    fn apply_remote_offer(&mut self, call_id: CallId, payload: &Value) -> Result<Value, MediaError>;

    /// Apply the remote answer to a previously created offer.
    fn apply_remote_answer(&mut self, call_id: CallId, payload: &Value) -> Result<(), MediaError>;

    /// Feed a remote connectivity candidate into the engine.
    fn add_ice_candidate(&mut self, call_id: CallId, payload: &Value) -> Result<(), MediaError>;

    /// Release every resource held for the call. Must be idempotent;
    /// the state machine calls it exactly once per call it started.
    fn release(&mut self, call_id: CallId);
}

/// Asynchronous notifications from the media engine to the call state
/// machine. Every event names its call so stale notifications from a
/// torn-down call can be discarded.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The media path is established and flowing.
    Established { call_id: CallId },

    /// The remote peer's media (first track or stream) arrived.
    RemoteMediaAdded { call_id: CallId },

    /// A local connectivity candidate is ready to trickle to the remote
    /// peer.
    LocalCandidate { call_id: CallId, payload: Value },

    /// The engine ended the session on its own, e.g. the remote side
    /// closed the media path.
    Ended { call_id: CallId },

    /// The media path failed irrecoverably.
    Failed { call_id: CallId, reason: String },
}
