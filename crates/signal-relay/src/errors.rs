//! Relay error types.
//!
//! Errors are reported only to the offending connection as a single
//! `error` event. Internal details are logged server-side but not exposed
//! on the wire.

use thiserror::Error;
use wire_protocol::CallId;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection attempted an action before registering (or after
    /// its identity was evicted).
    #[error("not registered")]
    NotRegistered,

    /// A resolve-by-userId or relay-by-connectionId lookup missed.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// A call state-machine guard rejected the requested transition.
    #[error("invalid transition: cannot {action} call {call_id} in state {state}")]
    InvalidTransition {
        call_id: CallId,
        action: &'static str,
        state: &'static str,
    },

    /// The peer's channel dropped mid-operation.
    #[error("transport disconnected")]
    TransportDisconnected,

    /// Internal error; details stay server-side.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns a client-safe message for the wire `error` event.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::NotRegistered => "User not registered".to_string(),
            RelayError::TargetUnavailable(_) => "Target user not found".to_string(),
            RelayError::InvalidTransition { action, state, .. } => {
                format!("Cannot {action} a call in state {state}")
            }
            RelayError::TransportDisconnected => "Connection lost".to_string(),
            RelayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
