//! WebSocket endpoint and per-connection session handling.
//!
//! Each accepted socket gets:
//!
//! - a fresh [`ConnectionId`] (never reused, never client-supplied)
//! - a bounded outbound mpsc channel, drained by a writer task that
//!   serializes [`ServerEvent`]s to text frames
//! - an inbound loop that parses [`ClientEvent`] frames and dispatches
//!   them against the shared state
//!
//! A malformed frame earns the sender a single `error` event and the
//! connection stays up. When the socket closes for any reason the
//! cleanup sequence runs exactly once: unregister, vacate rooms, fail
//! live calls, then broadcast `user-offline`.

use crate::calls::CallOrchestratorHandle;
use crate::registry::{ConnectionRegistry, RoomRegistry};
use crate::relay::SignalingRelay;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire_protocol::{ChatMessage, ClientEvent, ConnectionId, Identity, ServerEvent};

/// Outbound queue depth per connection. A peer that cannot drain this
/// many pending events starts losing them (best-effort delivery).
const OUTBOUND_BUFFER: usize = 64;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub relay: SignalingRelay,
    pub calls: CallOrchestratorHandle,
    /// Process start, for the status endpoint's uptime field.
    pub started_at: std::time::Instant,
}

/// Build the signaling router: the WebSocket endpoint plus request
/// tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one peer connection to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let (mut sink, mut stream) = socket.split();

    info!(
        target: "relay.server",
        connection_id = %connection_id,
        "Connection opened"
    );
    gauge!("relay_open_connections").increment(1.0);

    // Writer task: the only place frames are written, so per-connection
    // delivery order is the channel order.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(
                        target: "relay.server",
                        event = event.name(),
                        error = %e,
                        "Failed to serialize outbound event"
                    );
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(
                    target: "relay.server",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read error"
                );
                break;
            }
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    counter!("relay_events_received_total", "event" => event.name()).increment(1);
                    handle_event(&state, connection_id, &outbound_tx, event).await;
                }
                Err(e) => {
                    debug!(
                        target: "relay.server",
                        connection_id = %connection_id,
                        error = %e,
                        "Malformed frame"
                    );
                    send_self(
                        &outbound_tx,
                        ServerEvent::Error {
                            message: "Malformed event".to_string(),
                        },
                    )
                    .await;
                }
            },
            Message::Close(_) => break,
            // Ping/pong are answered by the websocket layer; binary
            // frames are not part of the protocol.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    cleanup(&state, connection_id).await;
    writer.abort();

    gauge!("relay_open_connections").decrement(1.0);
    info!(
        target: "relay.server",
        connection_id = %connection_id,
        "Connection closed"
    );
}

/// Dispatch one parsed client event.
async fn handle_event(
    state: &AppState,
    connection_id: ConnectionId,
    outbound_tx: &mpsc::Sender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Register {
            user_id,
            display_name,
            email,
        } => {
            let outcome = state
                .registry
                .register(
                    connection_id,
                    user_id,
                    display_name,
                    email,
                    outbound_tx.clone(),
                )
                .await;

            let snapshot = state.registry.snapshot().await;
            send_self(outbound_tx, ServerEvent::UsersList(snapshot)).await;
            state
                .relay
                .broadcast_except(&connection_id, ServerEvent::UserOnline(outcome.identity))
                .await;
        }

        ClientEvent::JoinRoom { room_id, .. } => {
            let Some(identity) = require_identity(state, &connection_id, outbound_tx).await else {
                return;
            };

            let members = state.rooms.join(room_id.clone(), identity.clone()).await;
            send_self(
                outbound_tx,
                ServerEvent::JoinedRoom {
                    room_id: room_id.clone(),
                    members: members.clone(),
                },
            )
            .await;

            for member in members {
                if member.connection_id == connection_id {
                    continue;
                }
                let _ = state
                    .relay
                    .forward(
                        &member.connection_id,
                        ServerEvent::UserJoined {
                            user: identity.clone(),
                            room_id: room_id.clone(),
                        },
                    )
                    .await;
            }
        }

        ClientEvent::LeaveRoom { room_id, .. } => {
            let Some(removed) = state.rooms.leave(&room_id, &connection_id).await else {
                return;
            };
            notify_room_departure(state, &room_id, removed).await;
        }

        ClientEvent::SendMessage {
            room_id,
            message,
            message_type,
        } => {
            let Some(identity) = require_identity(state, &connection_id, outbound_tx).await else {
                return;
            };

            let Some(members) = state.rooms.members(&room_id).await else {
                debug!(
                    target: "relay.server",
                    connection_id = %connection_id,
                    room_id = %room_id,
                    "Message to unknown room dropped"
                );
                return;
            };

            let chat = ChatMessage {
                id: Uuid::new_v4(),
                room_id,
                sender_id: identity.user_id,
                sender_name: identity.display_name,
                content: message,
                message_type,
                timestamp: Utc::now(),
            };

            // Fan-out includes the sender, which doubles as the ack.
            for member in members {
                let _ = state
                    .relay
                    .forward(&member.connection_id, ServerEvent::NewMessage(chat.clone()))
                    .await;
            }
        }

        ClientEvent::CallUser {
            target_user_id,
            call_type,
        } => {
            if let Err(e) = state
                .calls
                .initiate(connection_id, target_user_id, call_type)
                .await
            {
                report_error(outbound_tx, &connection_id, "call-user", &e).await;
            }
        }

        ClientEvent::AcceptCall { call_id, .. } => {
            if let Err(e) = state.calls.accept(call_id, connection_id).await {
                report_error(outbound_tx, &connection_id, "accept-call", &e).await;
            }
        }

        ClientEvent::RejectCall { call_id, .. } => {
            if let Err(e) = state.calls.reject(call_id, connection_id).await {
                report_error(outbound_tx, &connection_id, "reject-call", &e).await;
            }
        }

        ClientEvent::EndCall { call_id, .. } => {
            if let Err(e) = state.calls.end(call_id, connection_id).await {
                report_error(outbound_tx, &connection_id, "end-call", &e).await;
            }
        }

        ClientEvent::CallConnected { call_id } => {
            if let Err(e) = state.calls.mark_connected(call_id, connection_id).await {
                warn!(
                    target: "relay.server",
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to record media establishment"
                );
            }
        }

        ClientEvent::Offer { target, payload } => {
            relay_negotiation(
                state,
                connection_id,
                target,
                wire_protocol::NegotiationKind::Offer,
                payload,
            )
            .await;
        }

        ClientEvent::Answer { target, payload } => {
            relay_negotiation(
                state,
                connection_id,
                target,
                wire_protocol::NegotiationKind::Answer,
                payload,
            )
            .await;
        }

        ClientEvent::IceCandidate { target, payload } => {
            relay_negotiation(
                state,
                connection_id,
                target,
                wire_protocol::NegotiationKind::IceCandidate,
                payload,
            )
            .await;
        }
    }
}

/// Disconnect cleanup, in dependency order: identity first so the peer
/// stops resolving, rooms next, live calls after, presence broadcast
/// last so observers see a consistent final state.
async fn cleanup(state: &AppState, connection_id: ConnectionId) {
    let identity = state.registry.unregister(&connection_id).await;

    for (room_id, removed) in state.rooms.vacate(&connection_id).await {
        notify_room_departure(state, &room_id, removed).await;
    }

    if let Err(e) = state.calls.connection_closed(connection_id).await {
        error!(
            target: "relay.server",
            connection_id = %connection_id,
            error = %e,
            "Call cleanup failed on disconnect"
        );
    }

    if let Some(identity) = identity {
        state
            .relay
            .broadcast_except(&connection_id, ServerEvent::UserOffline(identity))
            .await;
    }
}

/// Tell a room's remaining members that someone left.
async fn notify_room_departure(
    state: &AppState,
    room_id: &wire_protocol::RoomId,
    removed: Identity,
) {
    let Some(members) = state.rooms.members(room_id).await else {
        return;
    };
    for member in members {
        let _ = state
            .relay
            .forward(
                &member.connection_id,
                ServerEvent::UserLeft {
                    user: removed.clone(),
                    room_id: room_id.clone(),
                },
            )
            .await;
    }
}

async fn relay_negotiation(
    state: &AppState,
    from: ConnectionId,
    target: ConnectionId,
    kind: wire_protocol::NegotiationKind,
    payload: serde_json::Value,
) {
    if let Err(e) = state.calls.negotiation(from, target, kind, payload).await {
        warn!(
            target: "relay.server",
            connection_id = %from,
            kind = %kind,
            error = %e,
            "Failed to enqueue negotiation payload"
        );
    }
}

/// Resolve the connection's identity, sending a `not registered` error
/// to the peer when it has none.
async fn require_identity(
    state: &AppState,
    connection_id: &ConnectionId,
    outbound_tx: &mpsc::Sender<ServerEvent>,
) -> Option<Identity> {
    let identity = state.registry.identity(connection_id).await;
    if identity.is_none() {
        send_self(
            outbound_tx,
            ServerEvent::Error {
                message: crate::errors::RelayError::NotRegistered.client_message(),
            },
        )
        .await;
    }
    identity
}

async fn report_error(
    outbound_tx: &mpsc::Sender<ServerEvent>,
    connection_id: &ConnectionId,
    action: &str,
    error: &crate::errors::RelayError,
) {
    debug!(
        target: "relay.server",
        connection_id = %connection_id,
        action,
        error = %error,
        "Rejected client action"
    );
    send_self(
        outbound_tx,
        ServerEvent::Error {
            message: error.client_message(),
        },
    )
    .await;
}

/// Deliver an event to the connection's own outbound queue. Failure
/// means the connection is tearing down; nothing to do.
async fn send_self(outbound_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    let _ = outbound_tx.send(event).await;
}
