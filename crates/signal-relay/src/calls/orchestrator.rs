//! `CallOrchestrator` - the authoritative call lifecycle actor.
//!
//! One orchestrator per relay process. It owns every call record and is
//! the only writer of call state:
//!
//! - Resolves call targets through the connection registry
//! - Delivers lifecycle and negotiation events through the signaling relay
//! - Serializes accept/reject/end/disconnect so racing operations on the
//!   same call observe a consistent, already-terminal record instead of a
//!   partially cleaned-up one
//! - Sweeps unanswered calls into `Failed` after the ring timeout and
//!   garbage-collects terminal records after the retention window
//!
//! # Race model
//!
//! The mailbox is the synchronization point. A disconnect cleanup and an
//! explicit `end-call` for the same call arrive as two messages; whichever
//! lands first terminates the call and notifies the survivor, the second
//! observes a terminal record and does nothing. The surviving party gets
//! exactly one termination notice.

use crate::errors::RelayError;
use crate::registry::ConnectionRegistry;
use crate::relay::SignalingRelay;

use super::record::{CallRecord, CallSnapshot, CallState};

use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wire_protocol::{
    CallId, CallType, ConnectionId, EndReason, NegotiationKind, ServerEvent, UserId,
};

/// Default channel buffer size for the orchestrator mailbox.
const CALL_CHANNEL_BUFFER: usize = 500;

/// Messages handled by the orchestrator actor.
enum CallMessage {
    Initiate {
        caller: ConnectionId,
        target_user_id: UserId,
        call_type: CallType,
        respond_to: oneshot::Sender<Result<CallId, RelayError>>,
    },
    Accept {
        call_id: CallId,
        actor: ConnectionId,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
    Reject {
        call_id: CallId,
        actor: ConnectionId,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
    End {
        call_id: CallId,
        actor: ConnectionId,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
    MarkConnected {
        call_id: CallId,
        actor: ConnectionId,
    },
    Negotiation {
        from: ConnectionId,
        target: ConnectionId,
        kind: NegotiationKind,
        payload: Value,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        call_id: CallId,
        respond_to: oneshot::Sender<Option<CallSnapshot>>,
    },
}

/// Handle to the `CallOrchestrator`.
///
/// Cloneable; all methods are async and return results via oneshot
/// channels.
#[derive(Clone)]
pub struct CallOrchestratorHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
}

impl CallOrchestratorHandle {
    /// Initiate a call. Returns the fresh call ID on success; the callee
    /// has been sent `incoming-call` and the caller `call-initiated`.
    pub async fn initiate(
        &self,
        caller: ConnectionId,
        target_user_id: UserId,
        call_type: CallType,
    ) -> Result<CallId, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::Initiate {
                caller,
                target_user_id,
                call_type,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Accept a call. Legal only from `Calling`/`Ringing`; anything else
    /// is an [`RelayError::InvalidTransition`] and a no-op.
    pub async fn accept(&self, call_id: CallId, actor: ConnectionId) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::Accept {
                call_id,
                actor,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Reject a call. Idempotent: unknown or already-terminal call IDs
    /// are silently ignored.
    pub async fn reject(&self, call_id: CallId, actor: ConnectionId) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::Reject {
                call_id,
                actor,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// End a call from any non-terminal state. Idempotent like `reject`.
    pub async fn end(&self, call_id: CallId, actor: ConnectionId) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::End {
                call_id,
                actor,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Record that a peer's media engine established the path.
    /// Diagnostics only; invalid reports are ignored.
    pub async fn mark_connected(
        &self,
        call_id: CallId,
        actor: ConnectionId,
    ) -> Result<(), RelayError> {
        self.sender
            .send(CallMessage::MarkConnected { call_id, actor })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))
    }

    /// Relay an opaque negotiation payload. Honored only while the
    /// sender and target share a call in `Accepted`/`Connected`;
    /// otherwise dropped without notice.
    pub async fn negotiation(
        &self,
        from: ConnectionId,
        target: ConnectionId,
        kind: NegotiationKind,
        payload: Value,
    ) -> Result<(), RelayError> {
        self.sender
            .send(CallMessage::Negotiation {
                from,
                target,
                kind,
                payload,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))
    }

    /// Terminate every non-terminal call involving the connection with
    /// reason `peer-disconnected`. Resolves when cleanup has run to
    /// completion, so callers can sequence the rest of disconnect
    /// handling behind it.
    pub async fn connection_closed(&self, connection_id: ConnectionId) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::ConnectionClosed {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Diagnostic view of a call record, if it still exists.
    pub async fn snapshot(&self, call_id: CallId) -> Result<Option<CallSnapshot>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::Snapshot {
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("mailbox send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the orchestrator actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for dependent tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `CallOrchestrator` implementation.
pub struct CallOrchestrator {
    receiver: mpsc::Receiver<CallMessage>,
    cancel_token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    relay: SignalingRelay,
    /// Call records by ID.
    calls: HashMap<CallId, CallRecord>,
    ring_timeout: Duration,
    terminal_retention: Duration,
    sweep_interval: Duration,
}

impl CallOrchestrator {
    /// Spawn the orchestrator actor.
    ///
    /// Returns a handle and the task join handle.
    #[must_use]
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        relay: SignalingRelay,
        ring_timeout: Duration,
        terminal_retention: Duration,
        sweep_interval: Duration,
        cancel_token: CancellationToken,
    ) -> (CallOrchestratorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            relay,
            calls: HashMap::new(),
            ring_timeout,
            terminal_retention,
            sweep_interval,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CallOrchestratorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.calls")]
    async fn run(mut self) {
        info!(target: "relay.calls", "CallOrchestrator started");

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.calls",
                        calls_remaining = self.calls.len(),
                        "CallOrchestrator received cancellation signal"
                    );
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(target: "relay.calls", "CallOrchestrator channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(target: "relay.calls", "CallOrchestrator stopped");
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::Initiate {
                caller,
                target_user_id,
                call_type,
                respond_to,
            } => {
                let result = self.handle_initiate(caller, target_user_id, call_type).await;
                let _ = respond_to.send(result);
            }
            CallMessage::Accept {
                call_id,
                actor,
                respond_to,
            } => {
                let result = self.handle_accept(call_id, actor).await;
                let _ = respond_to.send(result);
            }
            CallMessage::Reject {
                call_id,
                actor,
                respond_to,
            } => {
                let result = self.handle_reject(call_id, actor).await;
                let _ = respond_to.send(result);
            }
            CallMessage::End {
                call_id,
                actor,
                respond_to,
            } => {
                let result = self.handle_end(call_id, actor).await;
                let _ = respond_to.send(result);
            }
            CallMessage::MarkConnected { call_id, actor } => {
                self.handle_mark_connected(call_id, &actor);
            }
            CallMessage::Negotiation {
                from,
                target,
                kind,
                payload,
            } => {
                self.handle_negotiation(from, target, kind, payload).await;
            }
            CallMessage::ConnectionClosed {
                connection_id,
                respond_to,
            } => {
                self.handle_connection_closed(connection_id).await;
                let _ = respond_to.send(());
            }
            CallMessage::Snapshot {
                call_id,
                respond_to,
            } => {
                let snapshot = self.calls.get(&call_id).map(CallSnapshot::from);
                let _ = respond_to.send(snapshot);
            }
        }
    }

    async fn handle_initiate(
        &mut self,
        caller: ConnectionId,
        target_user_id: UserId,
        call_type: CallType,
    ) -> Result<CallId, RelayError> {
        let caller_identity = self
            .registry
            .identity(&caller)
            .await
            .ok_or(RelayError::NotRegistered)?;

        let callee_identity = self
            .registry
            .find_by_user_id(&target_user_id)
            .await
            .ok_or_else(|| RelayError::TargetUnavailable(target_user_id.to_string()))?;

        // At most one non-terminal call per (caller, callee) pair.
        if let Some(existing) = self.calls.values().find(|record| {
            !record.is_terminal()
                && record.caller.user_id == caller_identity.user_id
                && record.callee.user_id == callee_identity.user_id
        }) {
            return Err(RelayError::InvalidTransition {
                call_id: existing.call_id,
                action: "initiate",
                state: existing.state.as_str(),
            });
        }

        let call_id = CallId::new();
        let mut record = CallRecord::new(
            call_id,
            caller_identity.clone(),
            callee_identity.clone(),
            call_type,
        );

        // Deliver the invitation before committing the record; a target
        // that evaporated between lookup and delivery fails the initiate.
        self.relay
            .forward(
                &callee_identity.connection_id,
                ServerEvent::IncomingCall {
                    call_id,
                    caller: caller_identity.clone(),
                    call_type,
                },
            )
            .await?;

        // Target notified: the call is now ringing.
        record.state = CallState::Ringing;
        self.calls.insert(call_id, record);

        // Ack the caller. Best-effort: the caller also learns the ID from
        // this method's return value.
        let _ = self
            .relay
            .forward(
                &caller,
                ServerEvent::CallInitiated {
                    call_id,
                    target_user: callee_identity.clone(),
                },
            )
            .await;

        info!(
            target: "relay.calls",
            call_id = %call_id,
            caller = %caller_identity.user_id,
            callee = %callee_identity.user_id,
            call_type = ?call_type,
            "Call initiated"
        );
        counter!("relay_calls_initiated_total").increment(1);
        self.update_active_gauge();

        Ok(call_id)
    }

    async fn handle_accept(
        &mut self,
        call_id: CallId,
        actor: ConnectionId,
    ) -> Result<(), RelayError> {
        let Some(record) = self.calls.get_mut(&call_id) else {
            return Err(RelayError::InvalidTransition {
                call_id,
                action: "accept",
                state: "unknown",
            });
        };

        if record.callee.connection_id != actor {
            return Err(RelayError::InvalidTransition {
                call_id,
                action: "accept",
                state: record.state.as_str(),
            });
        }

        match record.state {
            CallState::Calling | CallState::Ringing => {
                record.state = CallState::Accepted;
                let caller_conn = record.caller.connection_id;
                let actor_identity = record.callee.clone();

                info!(
                    target: "relay.calls",
                    call_id = %call_id,
                    actor = %actor_identity.user_id,
                    "Call accepted"
                );

                let _ = self
                    .relay
                    .forward(
                        &caller_conn,
                        ServerEvent::CallAccepted {
                            call_id,
                            actor: actor_identity,
                        },
                    )
                    .await;
                Ok(())
            }
            state => Err(RelayError::InvalidTransition {
                call_id,
                action: "accept",
                state: state.as_str(),
            }),
        }
    }

    async fn handle_reject(
        &mut self,
        call_id: CallId,
        actor: ConnectionId,
    ) -> Result<(), RelayError> {
        let Some(record) = self.calls.get_mut(&call_id) else {
            debug!(target: "relay.calls", call_id = %call_id, "Reject for unknown call ignored");
            return Ok(());
        };

        if record.is_terminal() || record.callee.connection_id != actor {
            debug!(
                target: "relay.calls",
                call_id = %call_id,
                state = record.state.as_str(),
                "Reject ignored"
            );
            return Ok(());
        }

        match record.state {
            CallState::Calling | CallState::Ringing => {
                record.terminate(CallState::Rejected, EndReason::Rejected);
                let caller_conn = record.caller.connection_id;
                let actor_identity = record.callee.clone();

                info!(
                    target: "relay.calls",
                    call_id = %call_id,
                    actor = %actor_identity.user_id,
                    "Call rejected"
                );
                counter!("relay_calls_terminated_total", "reason" => EndReason::Rejected.as_str())
                    .increment(1);
                self.update_active_gauge();

                let _ = self
                    .relay
                    .forward(
                        &caller_conn,
                        ServerEvent::CallRejected {
                            call_id,
                            actor: actor_identity,
                        },
                    )
                    .await;
                Ok(())
            }
            state => Err(RelayError::InvalidTransition {
                call_id,
                action: "reject",
                state: state.as_str(),
            }),
        }
    }

    async fn handle_end(
        &mut self,
        call_id: CallId,
        actor: ConnectionId,
    ) -> Result<(), RelayError> {
        let Some(record) = self.calls.get_mut(&call_id) else {
            debug!(target: "relay.calls", call_id = %call_id, "End for unknown call ignored");
            return Ok(());
        };

        if record.is_terminal() {
            debug!(
                target: "relay.calls",
                call_id = %call_id,
                state = record.state.as_str(),
                "End for terminal call ignored"
            );
            return Ok(());
        }

        let Some(actor_identity) = record.party(&actor).cloned() else {
            warn!(
                target: "relay.calls",
                call_id = %call_id,
                connection_id = %actor,
                "End from a non-party connection ignored"
            );
            return Ok(());
        };

        record.terminate(CallState::Ended, EndReason::Ended);
        let survivor_conn = record
            .counterpart(&actor)
            .map(|identity| identity.connection_id);

        info!(
            target: "relay.calls",
            call_id = %call_id,
            actor = %actor_identity.user_id,
            "Call ended"
        );
        counter!("relay_calls_terminated_total", "reason" => EndReason::Ended.as_str())
            .increment(1);
        self.update_active_gauge();

        if let Some(survivor) = survivor_conn {
            let _ = self
                .relay
                .forward(
                    &survivor,
                    ServerEvent::CallEnded {
                        call_id,
                        actor: Some(actor_identity),
                        reason: EndReason::Ended,
                    },
                )
                .await;
        }

        Ok(())
    }

    fn handle_mark_connected(&mut self, call_id: CallId, actor: &ConnectionId) {
        let Some(record) = self.calls.get_mut(&call_id) else {
            return;
        };

        if record.state == CallState::Accepted && record.involves(actor) {
            record.state = CallState::Connected;
            debug!(
                target: "relay.calls",
                call_id = %call_id,
                "Media path reported established"
            );
        }
    }

    async fn handle_negotiation(
        &mut self,
        from: ConnectionId,
        target: ConnectionId,
        kind: NegotiationKind,
        payload: Value,
    ) {
        // Honored only while the pair shares a negotiable call; stale
        // payloads from ended negotiation rounds are dropped so they can
        // never resurrect a terminated call.
        let negotiable = self.calls.values().any(|record| {
            matches!(record.state, CallState::Accepted | CallState::Connected)
                && record.involves(&from)
                && record.involves(&target)
        });

        if !negotiable {
            debug!(
                target: "relay.calls",
                from = %from,
                to = %target,
                kind = %kind,
                "Negotiation payload without a negotiable call dropped"
            );
            return;
        }

        let event = match kind {
            NegotiationKind::Offer => ServerEvent::Offer { from, payload },
            NegotiationKind::Answer => ServerEvent::Answer { from, payload },
            NegotiationKind::IceCandidate => ServerEvent::IceCandidate { from, payload },
        };

        if let Err(e) = self.relay.forward(&target, event).await {
            debug!(
                target: "relay.calls",
                from = %from,
                to = %target,
                kind = %kind,
                error = %e,
                "Negotiation target gone, payload dropped"
            );
        }
    }

    async fn handle_connection_closed(&mut self, connection_id: ConnectionId) {
        let affected: Vec<CallId> = self
            .calls
            .values()
            .filter(|record| !record.is_terminal() && record.involves(&connection_id))
            .map(|record| record.call_id)
            .collect();

        for call_id in affected {
            let Some(record) = self.calls.get_mut(&call_id) else {
                continue;
            };

            let disconnected = record.party(&connection_id).cloned();
            record.terminate(CallState::Ended, EndReason::PeerDisconnected);
            let survivor_conn = record
                .counterpart(&connection_id)
                .map(|identity| identity.connection_id);

            info!(
                target: "relay.calls",
                call_id = %call_id,
                connection_id = %connection_id,
                "Call terminated by peer disconnect"
            );
            counter!(
                "relay_calls_terminated_total",
                "reason" => EndReason::PeerDisconnected.as_str()
            )
            .increment(1);

            if let Some(survivor) = survivor_conn {
                let _ = self
                    .relay
                    .forward(
                        &survivor,
                        ServerEvent::CallEnded {
                            call_id,
                            actor: disconnected,
                            reason: EndReason::PeerDisconnected,
                        },
                    )
                    .await;
            }
        }

        self.update_active_gauge();
    }

    /// Fail unanswered calls past the ring timeout and sweep terminal
    /// records past the retention window.
    async fn sweep(&mut self) {
        let timed_out: Vec<CallId> = self
            .calls
            .values()
            .filter(|record| {
                matches!(record.state, CallState::Calling | CallState::Ringing)
                    && record.created_instant.elapsed() >= self.ring_timeout
            })
            .map(|record| record.call_id)
            .collect();

        for call_id in timed_out {
            let Some(record) = self.calls.get_mut(&call_id) else {
                continue;
            };

            record.terminate(CallState::Failed, EndReason::RingTimeout);
            let parties = [
                record.caller.connection_id,
                record.callee.connection_id,
            ];

            warn!(
                target: "relay.calls",
                call_id = %call_id,
                "Call unanswered past ring timeout, failed"
            );
            counter!("relay_calls_terminated_total", "reason" => EndReason::RingTimeout.as_str())
                .increment(1);

            for party in parties {
                let _ = self
                    .relay
                    .forward(
                        &party,
                        ServerEvent::CallEnded {
                            call_id,
                            actor: None,
                            reason: EndReason::RingTimeout,
                        },
                    )
                    .await;
            }
        }

        let retention = self.terminal_retention;
        let before = self.calls.len();
        self.calls.retain(|_, record| {
            record
                .terminated_instant
                .is_none_or(|instant| instant.elapsed() < retention)
        });
        let swept = before - self.calls.len();
        if swept > 0 {
            debug!(target: "relay.calls", swept, "Swept terminal call records");
        }

        self.update_active_gauge();
    }

    fn update_active_gauge(&self) {
        let active = self
            .calls
            .values()
            .filter(|record| !record.is_terminal())
            .count();
        #[allow(clippy::cast_precision_loss)]
        gauge!("relay_active_calls").set(active as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    const RING_TIMEOUT: Duration = Duration::from_secs(30);
    const RETENTION: Duration = Duration::from_secs(300);
    const SWEEP: Duration = Duration::from_secs(5);

    struct Peer {
        connection_id: ConnectionId,
        rx: Receiver<ServerEvent>,
    }

    impl Peer {
        /// Receive the next event, panicking after a short timeout.
        async fn next_event(&mut self) -> ServerEvent {
            tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed")
        }

        fn no_pending_events(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        handle: CallOrchestratorHandle,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let relay = SignalingRelay::new(Arc::clone(&registry));
            let (handle, _task) = CallOrchestrator::spawn(
                Arc::clone(&registry),
                relay,
                RING_TIMEOUT,
                RETENTION,
                SWEEP,
                CancellationToken::new(),
            );
            Self { registry, handle }
        }

        async fn register(&self, user_id: &str) -> Peer {
            let connection_id = ConnectionId::new();
            let (tx, rx) = mpsc::channel(32);
            self.registry
                .register(
                    connection_id,
                    UserId::from(user_id),
                    user_id.to_string(),
                    format!("{user_id}@example.com"),
                    tx,
                )
                .await;
            Peer { connection_id, rx }
        }

        /// Register alice and bob and place a call alice -> bob,
        /// draining the initiation events on both sides.
        async fn ringing_call(&self) -> (Peer, Peer, CallId) {
            let mut alice = self.register("alice").await;
            let mut bob = self.register("bob").await;

            let call_id = self
                .handle
                .initiate(alice.connection_id, UserId::from("bob"), CallType::Voice)
                .await
                .unwrap();

            match bob.next_event().await {
                ServerEvent::IncomingCall { call_id: id, .. } => assert_eq!(id, call_id),
                other => panic!("expected incoming-call, got {other:?}"),
            }
            match alice.next_event().await {
                ServerEvent::CallInitiated { call_id: id, .. } => assert_eq!(id, call_id),
                other => panic!("expected call-initiated, got {other:?}"),
            }

            (alice, bob, call_id)
        }
    }

    #[tokio::test]
    async fn test_initiate_delivers_invitation_and_ack() {
        let harness = Harness::new();
        let (_, _, call_id) = harness.ringing_call().await;

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Ringing);
        assert_eq!(snapshot.caller.user_id, UserId::from("alice"));
        assert_eq!(snapshot.callee.user_id, UserId::from("bob"));
    }

    #[tokio::test]
    async fn test_initiate_requires_registration() {
        let harness = Harness::new();
        harness.register("bob").await;

        let result = harness
            .handle
            .initiate(ConnectionId::new(), UserId::from("bob"), CallType::Voice)
            .await;

        assert!(matches!(result, Err(RelayError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_initiate_unknown_target_is_unavailable() {
        let harness = Harness::new();
        let alice = harness.register("alice").await;

        let result = harness
            .handle
            .initiate(alice.connection_id, UserId::from("ghost"), CallType::Voice)
            .await;

        assert!(matches!(result, Err(RelayError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_call_ids_are_unique_per_pair_sequence() {
        let harness = Harness::new();
        let (alice, _bob, first) = harness.ringing_call().await;

        harness.handle.end(first, alice.connection_id).await.unwrap();
        let second = harness
            .handle
            .initiate(alice.connection_id, UserId::from("bob"), CallType::Voice)
            .await
            .unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_second_concurrent_call_for_pair_is_rejected() {
        let harness = Harness::new();
        let (alice, _bob, _call_id) = harness.ringing_call().await;

        let result = harness
            .handle
            .initiate(alice.connection_id, UserId::from("bob"), CallType::Voice)
            .await;

        assert!(matches!(
            result,
            Err(RelayError::InvalidTransition {
                action: "initiate",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_accept_moves_to_accepted_and_notifies_caller() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;

        harness.handle.accept(call_id, bob.connection_id).await.unwrap();

        match alice.next_event().await {
            ServerEvent::CallAccepted { call_id: id, actor } => {
                assert_eq!(id, call_id);
                assert_eq!(actor.user_id, UserId::from("bob"));
            }
            other => panic!("expected call-accepted, got {other:?}"),
        }

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Accepted);
    }

    #[tokio::test]
    async fn test_accept_by_caller_is_invalid() {
        let harness = Harness::new();
        let (alice, _bob, call_id) = harness.ringing_call().await;

        let result = harness.handle.accept(call_id, alice.connection_id).await;
        assert!(matches!(result, Err(RelayError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_accept_after_end_is_invalid_and_emits_nothing() {
        let harness = Harness::new();
        let (mut alice, mut bob, call_id) = harness.ringing_call().await;

        harness.handle.end(call_id, alice.connection_id).await.unwrap();
        match bob.next_event().await {
            ServerEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Ended),
            other => panic!("expected call-ended, got {other:?}"),
        }

        // Scenario: a late accept for the ended call is rejected and no
        // call-accepted reaches the caller.
        let result = harness.handle.accept(call_id, bob.connection_id).await;
        assert!(matches!(
            result,
            Err(RelayError::InvalidTransition { state: "ended", .. })
        ));
        assert!(alice.no_pending_events());
    }

    #[tokio::test]
    async fn test_accept_unknown_call_is_invalid() {
        let harness = Harness::new();
        let bob = harness.register("bob").await;

        let result = harness.handle.accept(CallId::new(), bob.connection_id).await;
        assert!(matches!(
            result,
            Err(RelayError::InvalidTransition {
                state: "unknown",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reject_notifies_caller_and_is_idempotent() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;

        harness.handle.reject(call_id, bob.connection_id).await.unwrap();
        match alice.next_event().await {
            ServerEvent::CallRejected { call_id: id, .. } => assert_eq!(id, call_id),
            other => panic!("expected call-rejected, got {other:?}"),
        }

        // Repeat rejects on the terminal call are silent no-ops.
        harness.handle.reject(call_id, bob.connection_id).await.unwrap();
        harness.handle.reject(call_id, bob.connection_id).await.unwrap();
        assert!(alice.no_pending_events());

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Rejected);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_unknown_end_is_a_no_op() {
        let harness = Harness::new();
        let (mut alice, mut bob, call_id) = harness.ringing_call().await;

        harness.handle.end(call_id, alice.connection_id).await.unwrap();
        match bob.next_event().await {
            ServerEvent::CallEnded { actor, reason, .. } => {
                assert_eq!(reason, EndReason::Ended);
                assert_eq!(actor.map(|a| a.user_id), Some(UserId::from("alice")));
            }
            other => panic!("expected call-ended, got {other:?}"),
        }

        // Second end: no second notice.
        harness.handle.end(call_id, alice.connection_id).await.unwrap();
        assert!(bob.no_pending_events());
        assert!(alice.no_pending_events());

        // Unknown call id: silent no-op.
        harness
            .handle
            .end(CallId::new(), alice.connection_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_terminates_call_with_reason() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;
        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await; // call-accepted

        harness
            .handle
            .connection_closed(bob.connection_id)
            .await
            .unwrap();

        match alice.next_event().await {
            ServerEvent::CallEnded { actor, reason, .. } => {
                assert_eq!(reason, EndReason::PeerDisconnected);
                assert_eq!(actor.map(|a| a.user_id), Some(UserId::from("bob")));
            }
            other => panic!("expected call-ended, got {other:?}"),
        }

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Ended);
        assert_eq!(
            snapshot.termination_reason,
            Some(EndReason::PeerDisconnected)
        );
    }

    #[tokio::test]
    async fn test_disconnect_racing_explicit_end_notifies_survivor_once() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;
        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await; // call-accepted

        // Both land in the mailbox; whichever is processed first
        // terminates, the second observes a terminal record.
        harness.handle.end(call_id, bob.connection_id).await.unwrap();
        harness
            .handle
            .connection_closed(bob.connection_id)
            .await
            .unwrap();

        match alice.next_event().await {
            ServerEvent::CallEnded { .. } => {}
            other => panic!("expected call-ended, got {other:?}"),
        }
        assert!(alice.no_pending_events());
    }

    #[tokio::test]
    async fn test_negotiation_before_accept_is_dropped() {
        let harness = Harness::new();
        let (alice, mut bob, _call_id) = harness.ringing_call().await;

        harness
            .handle
            .negotiation(
                alice.connection_id,
                bob.connection_id,
                NegotiationKind::Offer,
                serde_json::json!({ "sdp": "early" }),
            )
            .await
            .unwrap();

        // Give the actor a chance to process.
        tokio::task::yield_now().await;
        assert!(bob.no_pending_events());
    }

    #[tokio::test]
    async fn test_negotiation_relays_in_order_while_accepted() {
        let harness = Harness::new();
        let (mut alice, mut bob, call_id) = harness.ringing_call().await;
        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await; // call-accepted

        harness
            .handle
            .negotiation(
                alice.connection_id,
                bob.connection_id,
                NegotiationKind::Offer,
                serde_json::json!({ "seq": 0 }),
            )
            .await
            .unwrap();
        for seq in 1..5 {
            harness
                .handle
                .negotiation(
                    alice.connection_id,
                    bob.connection_id,
                    NegotiationKind::IceCandidate,
                    serde_json::json!({ "seq": seq }),
                )
                .await
                .unwrap();
        }

        match bob.next_event().await {
            ServerEvent::Offer { from, payload } => {
                assert_eq!(from, alice.connection_id);
                assert_eq!(payload["seq"], 0);
            }
            other => panic!("expected offer, got {other:?}"),
        }
        for seq in 1..5 {
            match bob.next_event().await {
                ServerEvent::IceCandidate { payload, .. } => {
                    assert_eq!(payload["seq"], seq);
                }
                other => panic!("expected ice-candidate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_after_end_is_dropped() {
        let harness = Harness::new();
        let (mut alice, mut bob, call_id) = harness.ringing_call().await;
        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await; // call-accepted
        harness.handle.end(call_id, alice.connection_id).await.unwrap();
        bob.next_event().await; // call-ended

        harness
            .handle
            .negotiation(
                alice.connection_id,
                bob.connection_id,
                NegotiationKind::Answer,
                serde_json::json!({ "sdp": "stale" }),
            )
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(bob.no_pending_events());

        // The stale payload must not have resurrected the call.
        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Ended);
    }

    #[tokio::test]
    async fn test_mark_connected_is_diagnostics_only() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;

        // Before accept: ignored.
        harness
            .handle
            .mark_connected(call_id, alice.connection_id)
            .await
            .unwrap();
        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Ringing);

        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await;

        harness
            .handle
            .mark_connected(call_id, alice.connection_id)
            .await
            .unwrap();
        // mark_connected has no response channel; snapshot forces the
        // mailbox to drain first.
        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_fails_after_ring_timeout() {
        let harness = Harness::new();
        let (mut alice, mut bob, call_id) = harness.ringing_call().await;

        tokio::time::advance(RING_TIMEOUT + SWEEP).await;
        tokio::task::yield_now().await;

        match alice.next_event().await {
            ServerEvent::CallEnded { reason, actor, .. } => {
                assert_eq!(reason, EndReason::RingTimeout);
                assert!(actor.is_none());
            }
            other => panic!("expected call-ended, got {other:?}"),
        }
        match bob.next_event().await {
            ServerEvent::CallEnded { reason, .. } => {
                assert_eq!(reason, EndReason::RingTimeout);
            }
            other => panic!("expected call-ended, got {other:?}"),
        }

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Failed);
        assert_eq!(snapshot.termination_reason, Some(EndReason::RingTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_call_is_not_timed_out() {
        let harness = Harness::new();
        let (mut alice, bob, call_id) = harness.ringing_call().await;
        harness.handle.accept(call_id, bob.connection_id).await.unwrap();
        alice.next_event().await;

        tokio::time::advance(RING_TIMEOUT + SWEEP).await;
        tokio::task::yield_now().await;

        let snapshot = harness.handle.snapshot(call_id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, CallState::Accepted);
        assert!(alice.no_pending_events());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_records_are_swept_after_retention() {
        let harness = Harness::new();
        let (alice, mut bob, call_id) = harness.ringing_call().await;

        harness.handle.end(call_id, alice.connection_id).await.unwrap();
        bob.next_event().await; // call-ended

        assert!(harness.handle.snapshot(call_id).await.unwrap().is_some());

        tokio::time::advance(RETENTION + SWEEP).await;
        tokio::task::yield_now().await;

        assert!(harness.handle.snapshot(call_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_actor() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = SignalingRelay::new(Arc::clone(&registry));
        let (handle, task) = CallOrchestrator::spawn(
            registry,
            relay,
            RING_TIMEOUT,
            RETENTION,
            SWEEP,
            CancellationToken::new(),
        );

        handle.cancel();
        assert!(handle.is_cancelled());

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }
}
