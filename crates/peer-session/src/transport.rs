//! `TransportSession` - the client's connection to the relay.
//!
//! One background task owns the WebSocket for its whole life:
//!
//! - On connect it immediately sends `register` with the configured
//!   identity, so the relay can resolve this peer before any other
//!   traffic.
//! - Incoming frames are parsed into [`ServerEvent`]s and routed into
//!   per-category broadcast channels ([`EventRouter`]), so presence UI,
//!   room UI, and the call state machine each consume only their slice.
//! - On disconnect it reconnects with bounded exponential backoff and
//!   re-registers; events queued by callers while offline flush after
//!   the re-register.
//!
//! Outbound writes and the register frame go through one sink, so frame
//! order on the wire matches submission order.

use crate::errors::SessionError;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wire_protocol::{ClientEvent, ServerEvent, UserId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth. Events submitted while disconnected park here
/// until the next successful register.
const OUTBOUND_BUFFER: usize = 64;

/// Capacity of each event category's broadcast channel. A subscriber
/// that lags past this loses the oldest events (`RecvError::Lagged`).
const EVENT_BUFFER: usize = 64;

/// Default initial reconnect backoff.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default bound on consecutive failed connection attempts before the
/// transport gives up.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 5;

/// The identity announced on every (re)connect.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: UserId,
    pub display_name: String,
    pub email: String,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay WebSocket URL (`ws://host:port/ws`).
    pub url: String,
    pub registration: Registration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed connection attempts tolerated before the task
    /// exits. The counter resets on every successful connect.
    pub max_connect_attempts: u32,
}

impl TransportConfig {
    /// Config with default backoff and retry bounds.
    #[must_use]
    pub fn new(url: String, registration: Registration) -> Self {
        Self {
            url,
            registration,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        }
    }
}

/// Routes decoded server events into per-category broadcast channels.
#[derive(Clone)]
pub struct EventRouter {
    presence: broadcast::Sender<ServerEvent>,
    rooms: broadcast::Sender<ServerEvent>,
    calls: broadcast::Sender<ServerEvent>,
    negotiation: broadcast::Sender<ServerEvent>,
    errors: broadcast::Sender<ServerEvent>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            presence: broadcast::channel(EVENT_BUFFER).0,
            rooms: broadcast::channel(EVENT_BUFFER).0,
            calls: broadcast::channel(EVENT_BUFFER).0,
            negotiation: broadcast::channel(EVENT_BUFFER).0,
            errors: broadcast::channel(EVENT_BUFFER).0,
        }
    }

    /// Deliver one event to its category's subscribers. Events nobody
    /// subscribes to are dropped silently.
    pub fn route(&self, event: ServerEvent) {
        let channel = match &event {
            ServerEvent::UsersList(_)
            | ServerEvent::UserOnline(_)
            | ServerEvent::UserOffline(_) => &self.presence,
            ServerEvent::JoinedRoom { .. }
            | ServerEvent::UserJoined { .. }
            | ServerEvent::UserLeft { .. }
            | ServerEvent::NewMessage(_) => &self.rooms,
            ServerEvent::IncomingCall { .. }
            | ServerEvent::CallInitiated { .. }
            | ServerEvent::CallAccepted { .. }
            | ServerEvent::CallRejected { .. }
            | ServerEvent::CallEnded { .. } => &self.calls,
            ServerEvent::Offer { .. }
            | ServerEvent::Answer { .. }
            | ServerEvent::IceCandidate { .. } => &self.negotiation,
            ServerEvent::Error { .. } => &self.errors,
        };
        let _ = channel.send(event);
    }

    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<ServerEvent> {
        self.presence.subscribe()
    }

    #[must_use]
    pub fn subscribe_rooms(&self) -> broadcast::Receiver<ServerEvent> {
        self.rooms.subscribe()
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> broadcast::Receiver<ServerEvent> {
        self.calls.subscribe()
    }

    #[must_use]
    pub fn subscribe_negotiation(&self) -> broadcast::Receiver<ServerEvent> {
        self.negotiation.subscribe()
    }

    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ServerEvent> {
        self.errors.subscribe()
    }
}

/// Handle to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<ClientEvent>,
    router: EventRouter,
    connected: watch::Receiver<bool>,
    cancel_token: CancellationToken,
}

impl TransportHandle {
    /// Queue an event for delivery to the relay. Queued events survive a
    /// reconnect and are sent after the re-register.
    pub async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// The raw outbound sender, for components that forward events
    /// themselves (the call state machine).
    #[must_use]
    pub fn outbound_sender(&self) -> mpsc::Sender<ClientEvent> {
        self.outbound.clone()
    }

    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<ServerEvent> {
        self.router.subscribe_presence()
    }

    #[must_use]
    pub fn subscribe_rooms(&self) -> broadcast::Receiver<ServerEvent> {
        self.router.subscribe_rooms()
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> broadcast::Receiver<ServerEvent> {
        self.router.subscribe_calls()
    }

    #[must_use]
    pub fn subscribe_negotiation(&self) -> broadcast::Receiver<ServerEvent> {
        self.router.subscribe_negotiation()
    }

    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ServerEvent> {
        self.router.subscribe_errors()
    }

    /// Whether the socket is currently up and registered.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch of the connection state, for callers that need to await
    /// (re)connection.
    #[must_use]
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Cancel the transport task.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the transport is cancelled.
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

/// Why one connection attempt's drive loop ended.
enum DriveOutcome {
    Cancelled,
    Disconnected,
}

/// The transport task implementation.
pub struct TransportSession {
    config: TransportConfig,
    outbound: mpsc::Receiver<ClientEvent>,
    router: EventRouter,
    connected: watch::Sender<bool>,
    cancel_token: CancellationToken,
}

impl TransportSession {
    /// Spawn the transport task.
    ///
    /// Returns a handle and the task join handle. The task connects,
    /// registers, and reconnects until cancelled.
    #[must_use]
    pub fn spawn(
        config: TransportConfig,
        cancel_token: CancellationToken,
    ) -> (TransportHandle, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let router = EventRouter::new();
        let (connected_tx, connected_rx) = watch::channel(false);

        let session = Self {
            config,
            outbound: outbound_rx,
            router: router.clone(),
            connected: connected_tx,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(session.run());

        let handle = TransportHandle {
            outbound: outbound_tx,
            router,
            connected: connected_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Connect/drive/reconnect loop.
    async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;
        let mut failed_attempts: u32 = 0;

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            match connect_async(&self.config.url).await {
                Ok((ws, _)) => {
                    info!(
                        target: "peer.transport",
                        url = %self.config.url,
                        "Connected to relay"
                    );
                    backoff = self.config.initial_backoff;
                    failed_attempts = 0;

                    let outcome = self.drive(ws).await;
                    self.connected.send_replace(false);

                    match outcome {
                        DriveOutcome::Cancelled => break,
                        DriveOutcome::Disconnected => {
                            warn!(
                                target: "peer.transport",
                                "Connection to relay lost, will reconnect"
                            );
                        }
                    }
                }
                Err(e) => {
                    failed_attempts += 1;
                    warn!(
                        target: "peer.transport",
                        url = %self.config.url,
                        attempt = failed_attempts,
                        error = %e,
                        "Failed to connect to relay"
                    );
                    if failed_attempts >= self.config.max_connect_attempts {
                        error!(
                            target: "peer.transport",
                            attempts = failed_attempts,
                            "Retry budget exhausted, transport giving up"
                        );
                        break;
                    }
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        info!(target: "peer.transport", "Transport stopped");
    }

    /// Drive one live connection: register, then pump both directions
    /// until the socket drops or the task is cancelled.
    async fn drive(&mut self, ws: WsStream) -> DriveOutcome {
        let (mut sink, mut stream) = ws.split();

        let register = ClientEvent::Register {
            user_id: self.config.registration.user_id.clone(),
            display_name: self.config.registration.display_name.clone(),
            email: self.config.registration.email.clone(),
        };
        if Self::write_event(&mut sink, &register).await.is_err() {
            return DriveOutcome::Disconnected;
        }
        self.connected.send_replace(true);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return DriveOutcome::Cancelled;
                }

                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        // Every handle dropped; nothing left to do.
                        return DriveOutcome::Cancelled;
                    };
                    if Self::write_event(&mut sink, &event).await.is_err() {
                        return DriveOutcome::Disconnected;
                    }
                }

                frame = stream.next() => {
                    match Self::handle_frame(&self.router, frame) {
                        Ok(()) => {}
                        Err(()) => return DriveOutcome::Disconnected,
                    }
                }
            }
        }
    }

    async fn write_event(
        sink: &mut SplitSink<WsStream, Message>,
        event: &ClientEvent,
    ) -> Result<(), ()> {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "peer.transport",
                    event = event.name(),
                    error = %e,
                    "Failed to serialize outbound event"
                );
                return Ok(());
            }
        };
        sink.send(Message::Text(text)).await.map_err(|e| {
            debug!(target: "peer.transport", error = %e, "Socket write failed");
        })
    }

    /// Decode and route one incoming frame. `Err` means the connection
    /// is gone.
    #[allow(clippy::result_unit_err)]
    fn handle_frame(
        router: &EventRouter,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Result<(), ()> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => router.route(event),
                    Err(e) => {
                        debug!(
                            target: "peer.transport",
                            error = %e,
                            "Undecodable frame from relay dropped"
                        );
                    }
                }
                Ok(())
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => Err(()),
            Some(Ok(_)) => Ok(()),
        }
    }
}
