//! Call records: the relay's authoritative state for one call attempt.

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use wire_protocol::{CallId, CallType, ConnectionId, EndReason, Identity};

/// Lifecycle state of a call, as the relay sees it.
///
/// Transitions are monotonic along
/// `Calling → Ringing → Accepted → Connected` with terminal exits to
/// `Ended`, `Rejected`, or `Failed` from any non-terminal state. No
/// transition ever revisits a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Caller initiated; the target is being notified.
    Calling,
    /// Target notified; awaiting its decision.
    Ringing,
    /// Target accepted; negotiation in progress.
    Accepted,
    /// Media established (peer-reported, diagnostics only).
    Connected,
    /// A party ended the call, or a party disconnected.
    Ended,
    /// The target declined.
    Rejected,
    /// The call never got answered (ring timeout) or negotiation failed.
    Failed,
}

impl CallState {
    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::Failed)
    }

    /// State name, for logging and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Rejected => "rejected",
            CallState::Failed => "failed",
        }
    }
}

/// The relay's record of one call attempt.
///
/// Created on initiation, mutated only through orchestrator transitions,
/// never deleted while non-terminal, swept a while after termination.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: CallId,
    /// Identity snapshot of the caller at initiation time. Snapshots
    /// survive registry eviction so termination notices stay attributable.
    pub caller: Identity,
    /// Identity snapshot of the callee at initiation time.
    pub callee: Identity,
    pub call_type: CallType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Monotonic creation time, for ring timeout sweeps.
    pub created_instant: Instant,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Monotonic termination time, for retention sweeps.
    pub terminated_instant: Option<Instant>,
    pub termination_reason: Option<EndReason>,
}

impl CallRecord {
    /// Create a fresh record in `Calling`.
    #[must_use]
    pub fn new(call_id: CallId, caller: Identity, callee: Identity, call_type: CallType) -> Self {
        Self {
            call_id,
            caller,
            callee,
            call_type,
            state: CallState::Calling,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            terminated_at: None,
            terminated_instant: None,
            termination_reason: None,
        }
    }

    /// Whether the record is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the connection is one of the call's two parties.
    #[must_use]
    pub fn involves(&self, connection_id: &ConnectionId) -> bool {
        &self.caller.connection_id == connection_id
            || &self.callee.connection_id == connection_id
    }

    /// The other party's identity, if the connection is a party at all.
    #[must_use]
    pub fn counterpart(&self, connection_id: &ConnectionId) -> Option<&Identity> {
        if &self.caller.connection_id == connection_id {
            Some(&self.callee)
        } else if &self.callee.connection_id == connection_id {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// The party identity for a connection, if it is a party.
    #[must_use]
    pub fn party(&self, connection_id: &ConnectionId) -> Option<&Identity> {
        if &self.caller.connection_id == connection_id {
            Some(&self.caller)
        } else if &self.callee.connection_id == connection_id {
            Some(&self.callee)
        } else {
            None
        }
    }

    /// Move the record to a terminal state. Caller must have checked the
    /// record is non-terminal; a second termination is ignored.
    pub fn terminate(&mut self, state: CallState, reason: EndReason) {
        debug_assert!(state.is_terminal());
        if self.is_terminal() {
            return;
        }
        self.state = state;
        self.terminated_at = Some(Utc::now());
        self.terminated_instant = Some(Instant::now());
        self.termination_reason = Some(reason);
    }
}

/// Diagnostic view of a call record.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub caller: Identity,
    pub callee: Identity,
    pub call_type: CallType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<EndReason>,
}

impl From<&CallRecord> for CallSnapshot {
    fn from(record: &CallRecord) -> Self {
        Self {
            call_id: record.call_id,
            caller: record.caller.clone(),
            callee: record.callee.clone(),
            call_type: record.call_type,
            state: record.state,
            created_at: record.created_at,
            terminated_at: record.terminated_at,
            termination_reason: record.termination_reason,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wire_protocol::UserId;

    fn identity(user_id: &str) -> Identity {
        Identity::new(
            ConnectionId::new(),
            UserId::from(user_id),
            user_id.to_string(),
            format!("{user_id}@example.com"),
        )
    }

    fn record() -> CallRecord {
        CallRecord::new(
            CallId::new(),
            identity("alice"),
            identity("bob"),
            CallType::Voice,
        )
    }

    #[test]
    fn test_new_record_starts_calling() {
        let record = record();
        assert_eq!(record.state, CallState::Calling);
        assert!(!record.is_terminal());
        assert!(record.terminated_at.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(CallState::Ended.is_terminal());
        assert!(CallState::Rejected.is_terminal());
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Calling.is_terminal());
        assert!(!CallState::Ringing.is_terminal());
        assert!(!CallState::Accepted.is_terminal());
        assert!(!CallState::Connected.is_terminal());
    }

    #[test]
    fn test_counterpart_resolution() {
        let record = record();
        let caller_conn = record.caller.connection_id;
        let callee_conn = record.callee.connection_id;

        assert_eq!(
            record.counterpart(&caller_conn).map(|i| i.user_id.clone()),
            Some(UserId::from("bob"))
        );
        assert_eq!(
            record.counterpart(&callee_conn).map(|i| i.user_id.clone()),
            Some(UserId::from("alice"))
        );
        assert!(record.counterpart(&ConnectionId::new()).is_none());
        assert!(record.involves(&caller_conn));
        assert!(!record.involves(&ConnectionId::new()));
    }

    #[test]
    fn test_terminate_is_one_shot() {
        let mut record = record();
        record.terminate(CallState::Ended, wire_protocol::EndReason::Ended);
        assert_eq!(record.state, CallState::Ended);

        // A second termination must not overwrite the first.
        record.terminate(CallState::Failed, wire_protocol::EndReason::RingTimeout);
        assert_eq!(record.state, CallState::Ended);
        assert_eq!(
            record.termination_reason,
            Some(wire_protocol::EndReason::Ended)
        );
    }
}
