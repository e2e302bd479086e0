//! `CallSession` - the client-side call state machine.
//!
//! A single actor task owns all call state and is the only code that
//! talks to the [`MediaEngine`]. It merges four inputs in one select
//! loop: user commands, call lifecycle events from the relay,
//! negotiation payloads from the relay, and asynchronous media engine
//! events. One writer means no phase can be observed mid-transition and
//! the engine is released exactly once per call.
//!
//! # Phase model
//!
//! ```text
//! Idle ──place_call──▶ Dialing ──call-accepted──▶ Connecting ──media──▶ Active
//! Idle ◀──incoming-call── IncomingRinging ──accept──▶ Connecting
//! ```
//!
//! Every terminal path (hang up, remote end, reject, media failure,
//! relay-side timeout) funnels through one teardown that releases the
//! engine and resets to `Idle`. Events carrying a call ID other than the
//! current call's are stale and dropped, so a straggler from a previous
//! call can never disturb a new one.

use crate::errors::SessionError;
use crate::media::{MediaEngine, MediaEvent};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wire_protocol::{CallId, CallType, ClientEvent, Identity, ServerEvent, UserId};

/// Command mailbox depth. Commands are user-initiated and rare.
const COMMAND_BUFFER: usize = 16;

/// Where the local peer is in a call's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// No call in progress.
    Idle,
    /// We placed a call and are waiting for the callee's decision.
    Dialing,
    /// A remote call invitation is waiting for our decision.
    IncomingRinging,
    /// Both sides agreed; media negotiation in progress.
    Connecting,
    /// Media established and flowing.
    Active,
}

impl CallPhase {
    /// Phase name, for logging and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Dialing => "dialing",
            CallPhase::IncomingRinging => "incoming-ringing",
            CallPhase::Connecting => "connecting",
            CallPhase::Active => "active",
        }
    }
}

/// User commands handled by the session actor.
enum Command {
    PlaceCall {
        target_user_id: UserId,
        call_type: CallType,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Accept {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Reject {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    HangUp {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Handle to the call session actor.
#[derive(Clone)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<Command>,
    phase: watch::Receiver<CallPhase>,
    remote_media: watch::Receiver<bool>,
    cancel_token: CancellationToken,
}

impl CallSessionHandle {
    /// Place an outbound call. Fails with
    /// [`SessionError::CallAlreadyActive`] unless the session is idle.
    pub async fn place_call(
        &self,
        target_user_id: UserId,
        call_type: CallType,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::PlaceCall {
                target_user_id,
                call_type,
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Accept the currently ringing incoming call.
    pub async fn accept(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Accept { respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Decline the currently ringing incoming call.
    pub async fn reject(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Reject { respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// End the current call from any phase. Idempotent: hanging up while
    /// idle is a no-op.
    pub async fn hang_up(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::HangUp { respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Current phase snapshot.
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        *self.phase.borrow()
    }

    /// Watch of the phase, for UI updates.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<CallPhase> {
        self.phase.clone()
    }

    /// True once the remote peer's media has arrived for the current
    /// call. Resets on teardown.
    #[must_use]
    pub fn has_remote_media(&self) -> bool {
        *self.remote_media.borrow()
    }

    /// Watch of remote media arrival, for UI updates.
    #[must_use]
    pub fn remote_media_watch(&self) -> watch::Receiver<bool> {
        self.remote_media.clone()
    }

    /// Cancel the session actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Bookkeeping for the call in progress.
struct CurrentCall {
    /// Unknown between `place_call` and the relay's `call-initiated`.
    call_id: Option<CallId>,
    /// The counterparty, once the relay names it.
    remote: Option<Identity>,
    call_type: CallType,
    /// True when the local peer placed the call.
    outbound: bool,
    /// True once `begin_session` succeeded; gates the release call.
    media_started: bool,
}

impl CurrentCall {
    fn matches(&self, call_id: CallId) -> bool {
        self.call_id == Some(call_id)
    }

    fn remote_connection(&self) -> Option<wire_protocol::ConnectionId> {
        self.remote.as_ref().map(|identity| identity.connection_id)
    }
}

/// The call session actor.
pub struct CallSession<E: MediaEngine> {
    commands: mpsc::Receiver<Command>,
    call_events: broadcast::Receiver<ServerEvent>,
    negotiation_events: broadcast::Receiver<ServerEvent>,
    media_events: mpsc::Receiver<MediaEvent>,
    outbound: mpsc::Sender<ClientEvent>,
    engine: E,
    current: Option<CurrentCall>,
    phase: watch::Sender<CallPhase>,
    remote_media: watch::Sender<bool>,
    cancel_token: CancellationToken,
}

impl<E: MediaEngine> CallSession<E> {
    /// Spawn the session actor on a transport handle.
    #[must_use]
    pub fn spawn_on_transport(
        transport: &crate::transport::TransportHandle,
        engine: E,
        media_events: mpsc::Receiver<MediaEvent>,
    ) -> (CallSessionHandle, JoinHandle<()>) {
        Self::spawn(
            transport.outbound_sender(),
            transport.subscribe_calls(),
            transport.subscribe_negotiation(),
            engine,
            media_events,
            transport.child_token(),
        )
    }

    /// Spawn the session actor from its raw inputs.
    #[must_use]
    pub fn spawn(
        outbound: mpsc::Sender<ClientEvent>,
        call_events: broadcast::Receiver<ServerEvent>,
        negotiation_events: broadcast::Receiver<ServerEvent>,
        engine: E,
        media_events: mpsc::Receiver<MediaEvent>,
        cancel_token: CancellationToken,
    ) -> (CallSessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (phase_tx, phase_rx) = watch::channel(CallPhase::Idle);
        let (remote_media_tx, remote_media_rx) = watch::channel(false);

        let session = Self {
            commands: command_rx,
            call_events,
            negotiation_events,
            media_events,
            outbound,
            engine,
            current: None,
            phase: phase_tx,
            remote_media: remote_media_tx,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(session.run());

        let handle = CallSessionHandle {
            sender: command_tx,
            phase: phase_rx,
            remote_media: remote_media_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    async fn run(mut self) {
        info!(target: "peer.call", "Call session started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.teardown(true).await;
                    break;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.teardown(true).await;
                            break;
                        }
                    }
                }

                event = self.call_events.recv() => {
                    match event {
                        Ok(event) => self.handle_call_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(target: "peer.call", skipped = n, "Call event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.teardown(false).await;
                            break;
                        }
                    }
                }

                event = self.negotiation_events.recv() => {
                    match event {
                        Ok(event) => self.handle_negotiation_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(target: "peer.call", skipped = n, "Negotiation stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.teardown(false).await;
                            break;
                        }
                    }
                }

                event = self.media_events.recv() => {
                    if let Some(event) = event {
                        self.handle_media_event(event).await;
                    }
                }
            }
        }

        info!(target: "peer.call", "Call session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaceCall {
                target_user_id,
                call_type,
                respond_to,
            } => {
                let result = self.place_call(target_user_id, call_type).await;
                let _ = respond_to.send(result);
            }
            Command::Accept { respond_to } => {
                let result = self.accept_incoming().await;
                let _ = respond_to.send(result);
            }
            Command::Reject { respond_to } => {
                let result = self.reject_incoming().await;
                let _ = respond_to.send(result);
            }
            Command::HangUp { respond_to } => {
                if self.current.is_some() {
                    self.teardown(true).await;
                }
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn place_call(
        &mut self,
        target_user_id: UserId,
        call_type: CallType,
    ) -> Result<(), SessionError> {
        if self.current.is_some() {
            return Err(SessionError::CallAlreadyActive);
        }

        self.outbound
            .send(ClientEvent::CallUser {
                target_user_id: target_user_id.clone(),
                call_type,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        info!(target: "peer.call", target = %target_user_id, "Placing call");
        self.current = Some(CurrentCall {
            call_id: None,
            remote: None,
            call_type,
            outbound: true,
            media_started: false,
        });
        self.phase.send_replace(CallPhase::Dialing);
        Ok(())
    }

    async fn accept_incoming(&mut self) -> Result<(), SessionError> {
        let phase = *self.phase.borrow();
        if phase != CallPhase::IncomingRinging {
            return Err(SessionError::InvalidState {
                action: "accept",
                phase: phase.as_str(),
            });
        }
        let Some(current) = self.current.as_mut() else {
            return Err(SessionError::InvalidState {
                action: "accept",
                phase: phase.as_str(),
            });
        };
        let Some(call_id) = current.call_id else {
            return Err(SessionError::InvalidState {
                action: "accept",
                phase: phase.as_str(),
            });
        };

        if let Err(e) = self
            .engine
            .begin_session(call_id, current.call_type, false)
        {
            warn!(target: "peer.call", call_id = %call_id, error = %e, "Media engine refused session");
            self.teardown(true).await;
            return Err(SessionError::Media(e));
        }
        current.media_started = true;

        self.outbound
            .send(ClientEvent::AcceptCall {
                call_id,
                target_socket_id: None,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        info!(target: "peer.call", call_id = %call_id, "Accepted incoming call");
        self.phase.send_replace(CallPhase::Connecting);
        Ok(())
    }

    async fn reject_incoming(&mut self) -> Result<(), SessionError> {
        let phase = *self.phase.borrow();
        if phase != CallPhase::IncomingRinging {
            return Err(SessionError::InvalidState {
                action: "reject",
                phase: phase.as_str(),
            });
        }

        if let Some(call_id) = self.current.as_ref().and_then(|c| c.call_id) {
            let _ = self
                .outbound
                .send(ClientEvent::RejectCall {
                    call_id,
                    target_socket_id: None,
                })
                .await;
            info!(target: "peer.call", call_id = %call_id, "Rejected incoming call");
        }

        // Media never started while ringing; plain reset.
        self.current = None;
        self.phase.send_replace(CallPhase::Idle);
        Ok(())
    }

    async fn handle_call_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall {
                call_id,
                caller,
                call_type,
            } => {
                if self.current.is_some() {
                    // Busy: decline the new invitation without touching
                    // the call in progress.
                    debug!(
                        target: "peer.call",
                        call_id = %call_id,
                        "Busy, auto-rejecting incoming call"
                    );
                    let _ = self
                        .outbound
                        .send(ClientEvent::RejectCall {
                            call_id,
                            target_socket_id: None,
                        })
                        .await;
                    return;
                }

                info!(
                    target: "peer.call",
                    call_id = %call_id,
                    caller = %caller.user_id,
                    "Incoming call"
                );
                self.current = Some(CurrentCall {
                    call_id: Some(call_id),
                    remote: Some(caller),
                    call_type,
                    outbound: false,
                    media_started: false,
                });
                self.phase.send_replace(CallPhase::IncomingRinging);
            }

            ServerEvent::CallInitiated {
                call_id,
                target_user,
            } => {
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                if current.outbound && current.call_id.is_none() {
                    current.call_id = Some(call_id);
                    current.remote = Some(target_user);
                }
            }

            ServerEvent::CallAccepted { call_id, actor } => {
                let is_ours = self
                    .current
                    .as_ref()
                    .is_some_and(|c| c.outbound && c.matches(call_id));
                if !is_ours {
                    debug!(target: "peer.call", call_id = %call_id, "Stale call-accepted dropped");
                    return;
                }
                self.start_caller_media(call_id, actor).await;
            }

            ServerEvent::CallRejected { call_id, .. } => {
                if self.current.as_ref().is_some_and(|c| c.matches(call_id)) {
                    info!(target: "peer.call", call_id = %call_id, "Call rejected by remote");
                    self.teardown(false).await;
                }
            }

            ServerEvent::CallEnded {
                call_id, reason, ..
            } => {
                if self.current.as_ref().is_some_and(|c| c.matches(call_id)) {
                    info!(
                        target: "peer.call",
                        call_id = %call_id,
                        reason = reason.as_str(),
                        "Call ended by relay"
                    );
                    // The relay already closed the record; no end-call
                    // echo needed.
                    self.teardown(false).await;
                } else {
                    debug!(target: "peer.call", call_id = %call_id, "Stale call-ended dropped");
                }
            }

            _ => {}
        }
    }

    /// The callee accepted our call: bring up media and send the offer.
    async fn start_caller_media(&mut self, call_id: CallId, actor: Identity) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        // The accept names the actor's live connection; prefer it over
        // the snapshot from call-initiated.
        current.remote = Some(actor.clone());

        if let Err(e) = self.engine.begin_session(call_id, current.call_type, true) {
            warn!(target: "peer.call", call_id = %call_id, error = %e, "Media engine refused session");
            self.teardown(true).await;
            return;
        }
        if let Some(c) = self.current.as_mut() {
            c.media_started = true;
        }

        let offer = match self.engine.create_offer(call_id) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(target: "peer.call", call_id = %call_id, error = %e, "Offer creation failed");
                self.teardown(true).await;
                return;
            }
        };

        let _ = self
            .outbound
            .send(ClientEvent::Offer {
                target: actor.connection_id,
                payload: offer,
            })
            .await;
        self.phase.send_replace(CallPhase::Connecting);
    }

    async fn handle_negotiation_event(&mut self, event: ServerEvent) {
        let phase = *self.phase.borrow();
        let Some((call_id, remote_conn, outbound)) = self.current.as_ref().and_then(|current| {
            Some((
                current.call_id?,
                current.remote_connection()?,
                current.outbound,
            ))
        }) else {
            debug!(target: "peer.call", "Negotiation payload without a call dropped");
            return;
        };

        match event {
            ServerEvent::Offer { from, payload } => {
                if phase != CallPhase::Connecting || outbound || from != remote_conn {
                    debug!(target: "peer.call", "Stale offer dropped");
                    return;
                }
                match self.engine.apply_remote_offer(call_id, &payload) {
                    Ok(answer) => {
                        let _ = self
                            .outbound
                            .send(ClientEvent::Answer {
                                target: from,
                                payload: answer,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!(target: "peer.call", call_id = %call_id, error = %e, "Remote offer failed");
                        self.teardown(true).await;
                    }
                }
            }

            ServerEvent::Answer { from, payload } => {
                if phase != CallPhase::Connecting || !outbound || from != remote_conn {
                    debug!(target: "peer.call", "Stale answer dropped");
                    return;
                }
                if let Err(e) = self.engine.apply_remote_answer(call_id, &payload) {
                    warn!(target: "peer.call", call_id = %call_id, error = %e, "Remote answer failed");
                    self.teardown(true).await;
                }
            }

            ServerEvent::IceCandidate { from, payload } => {
                let negotiable =
                    matches!(phase, CallPhase::Connecting | CallPhase::Active);
                if !negotiable || from != remote_conn {
                    debug!(target: "peer.call", "Stale candidate dropped");
                    return;
                }
                // Candidate failures are not fatal; the pair is just
                // skipped.
                if let Err(e) = self.engine.add_ice_candidate(call_id, &payload) {
                    debug!(target: "peer.call", call_id = %call_id, error = %e, "Candidate rejected");
                }
            }

            _ => {}
        }
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Established { call_id } => {
                let is_current = self.current.as_ref().is_some_and(|c| c.matches(call_id));
                if !is_current || *self.phase.borrow() != CallPhase::Connecting {
                    debug!(target: "peer.call", call_id = %call_id, "Stale media-established dropped");
                    return;
                }
                info!(target: "peer.call", call_id = %call_id, "Media established");
                self.phase.send_replace(CallPhase::Active);
                let _ = self
                    .outbound
                    .send(ClientEvent::CallConnected { call_id })
                    .await;
            }

            MediaEvent::RemoteMediaAdded { call_id } => {
                if self.current.as_ref().is_some_and(|c| c.matches(call_id)) {
                    info!(target: "peer.call", call_id = %call_id, "Remote media added");
                    self.remote_media.send_replace(true);
                } else {
                    debug!(target: "peer.call", call_id = %call_id, "Stale remote-media dropped");
                }
            }

            MediaEvent::LocalCandidate { call_id, payload } => {
                let target = self
                    .current
                    .as_ref()
                    .filter(|c| c.matches(call_id))
                    .and_then(CurrentCall::remote_connection);
                let Some(target) = target else {
                    debug!(target: "peer.call", call_id = %call_id, "Stale local candidate dropped");
                    return;
                };
                let _ = self
                    .outbound
                    .send(ClientEvent::IceCandidate { target, payload })
                    .await;
            }

            MediaEvent::Ended { call_id } => {
                if self.current.as_ref().is_some_and(|c| c.matches(call_id)) {
                    info!(target: "peer.call", call_id = %call_id, "Media session ended by engine");
                    self.teardown(true).await;
                }
            }

            MediaEvent::Failed { call_id, reason } => {
                if self.current.as_ref().is_some_and(|c| c.matches(call_id)) {
                    warn!(target: "peer.call", call_id = %call_id, reason, "Media path failed");
                    self.teardown(true).await;
                }
            }
        }
    }

    /// The single teardown funnel. Releases the engine at most once and
    /// resets to `Idle`. `notify_relay` sends `end-call` for calls the
    /// relay does not already know are over.
    async fn teardown(&mut self, notify_relay: bool) {
        let Some(current) = self.current.take() else {
            return;
        };

        if let Some(call_id) = current.call_id {
            if notify_relay {
                let _ = self
                    .outbound
                    .send(ClientEvent::EndCall {
                        call_id,
                        target_socket_id: None,
                    })
                    .await;
            }
            if current.media_started {
                self.engine.release(call_id);
            }
            info!(target: "peer.call", call_id = %call_id, "Call torn down");
        }

        self.remote_media.send_replace(false);
        self.phase.send_replace(CallPhase::Idle);
    }
}
