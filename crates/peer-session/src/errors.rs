//! Client session error types.

use crate::media::MediaError;
use thiserror::Error;

/// Client session error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A call is already in progress; the session is strictly
    /// single-call.
    #[error("another call is already active")]
    CallAlreadyActive,

    /// The requested action is not legal in the current phase.
    #[error("cannot {action} in phase {phase}")]
    InvalidState {
        action: &'static str,
        phase: &'static str,
    },

    /// The transport is not currently connected to the relay.
    #[error("transport not connected")]
    NotConnected,

    /// A transport-level failure (connect, serialize, socket write).
    #[error("transport error: {0}")]
    Transport(String),

    /// The session or transport actor has shut down.
    #[error("session closed")]
    Closed,

    /// The media engine refused or failed an operation.
    #[error(transparent)]
    Media(#[from] MediaError),
}
