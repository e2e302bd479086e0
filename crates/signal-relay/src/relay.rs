//! `SignalingRelay` - stateless event delivery by connection id.
//!
//! Delivery is at-most-once and best-effort: a full or closed outbound
//! queue drops the event rather than blocking the sender's task. Order
//! is preserved per sender→target pair because each connection's
//! outbound queue is a FIFO and each sending task enqueues sequentially.
//! Payload content is never inspected or transformed.

use crate::errors::RelayError;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tracing::{debug, warn};
use wire_protocol::{ConnectionId, ServerEvent};

/// Stateless pass-through from one connection to another.
#[derive(Clone)]
pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
}

impl SignalingRelay {
    /// Create a relay over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver an event to the target connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::TargetUnavailable`] when no live registered
    /// connection matches; the sender is not automatically notified by
    /// this component.
    pub async fn forward(
        &self,
        target: &ConnectionId,
        event: ServerEvent,
    ) -> Result<(), RelayError> {
        let Some(sender) = self.registry.sender(target).await else {
            debug!(
                target: "relay.signaling",
                connection_id = %target,
                event = event.name(),
                "Forward target not registered"
            );
            return Err(RelayError::TargetUnavailable(target.to_string()));
        };

        if let Err(e) = sender.try_send(event) {
            // Best-effort: a saturated or closing connection loses the
            // event rather than stalling the sender.
            warn!(
                target: "relay.signaling",
                connection_id = %target,
                error = %e,
                "Dropped event for saturated or closing connection"
            );
        }

        Ok(())
    }

    /// Deliver an event to every registered connection except one.
    /// Used for presence broadcasts.
    pub async fn broadcast_except(&self, excluded: &ConnectionId, event: ServerEvent) {
        let senders = self.registry.senders_except(excluded).await;
        for sender in senders {
            // Best-effort: saturated connections miss this broadcast and
            // converge on the next snapshot.
            let _ = sender.try_send(event.clone());
        }
    }
}
