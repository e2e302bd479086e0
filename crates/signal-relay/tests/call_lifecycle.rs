//! End-to-end lifecycle tests against a real listener.
//!
//! Each test binds the relay on an ephemeral port and drives it with
//! plain WebSocket clients speaking the JSON event protocol, covering
//! the full register/room/call flows a real peer would execute.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use futures_util::{SinkExt, StreamExt};
use signal_relay::calls::CallOrchestrator;
use signal_relay::observability::status_router;
use signal_relay::registry::{ConnectionRegistry, RoomRegistry};
use signal_relay::relay::SignalingRelay;
use signal_relay::server::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wire_protocol::{
    CallId, CallType, ClientEvent, ConnectionId, EndReason, Identity, RoomId, ServerEvent, UserId,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

async fn spawn_relay() -> SocketAddr {
    let registry = Arc::new(ConnectionRegistry::new());
    let rooms = Arc::new(RoomRegistry::new());
    let relay = SignalingRelay::new(Arc::clone(&registry));
    let (calls, _task) = CallOrchestrator::spawn(
        Arc::clone(&registry),
        relay.clone(),
        Duration::from_secs(30),
        Duration::from_secs(300),
        Duration::from_secs(5),
        CancellationToken::new(),
    );
    let state = AppState {
        registry,
        rooms,
        relay,
        calls,
        started_at: std::time::Instant::now(),
    };

    let app = server::router(state.clone()).merge(status_router(state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    addr
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connect");
        Client { ws }
    }

    async fn send(&mut self, event: &ClientEvent) {
        let text = serde_json::to_string(event).unwrap();
        self.ws.send(Message::Text(text)).await.expect("ws send");
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("ws send");
    }

    async fn next_event(&mut self) -> ServerEvent {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .expect("socket error");
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("parse server event");
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Assert no event arrives within the quiet period.
    async fn assert_quiet(&mut self) {
        let outcome = tokio::time::timeout(QUIET_PERIOD, self.ws.next()).await;
        assert!(outcome.is_err(), "expected quiet, got {outcome:?}");
    }

    /// Register and return the presence snapshot from `users-list`.
    async fn register(&mut self, user_id: &str) -> Vec<Identity> {
        self.send(&ClientEvent::Register {
            user_id: UserId::from(user_id),
            display_name: user_id.to_uppercase(),
            email: format!("{user_id}@example.com"),
        })
        .await;

        match self.next_event().await {
            ServerEvent::UsersList(users) => users,
            other => panic!("expected users-list, got {other:?}"),
        }
    }
}

fn connection_of(users: &[Identity], user_id: &str) -> ConnectionId {
    users
        .iter()
        .find(|identity| identity.user_id == UserId::from(user_id))
        .map(|identity| identity.connection_id)
        .expect("user in snapshot")
}

/// Register alice and bob, drain presence events, and place a call from
/// alice to bob, returning both clients, their connection ids, and the
/// ringing call's id.
async fn ringing_call(addr: SocketAddr) -> (Client, Client, ConnectionId, ConnectionId, CallId) {
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;

    let snapshot = alice.register("alice").await;
    let alice_conn = connection_of(&snapshot, "alice");
    let snapshot = bob.register("bob").await;
    let bob_conn = connection_of(&snapshot, "bob");

    match alice.next_event().await {
        ServerEvent::UserOnline(user) => assert_eq!(user.user_id, UserId::from("bob")),
        other => panic!("expected user-online, got {other:?}"),
    }

    alice
        .send(&ClientEvent::CallUser {
            target_user_id: UserId::from("bob"),
            call_type: CallType::Voice,
        })
        .await;

    let call_id = match bob.next_event().await {
        ServerEvent::IncomingCall {
            call_id,
            caller,
            call_type,
        } => {
            assert_eq!(caller.user_id, UserId::from("alice"));
            assert_eq!(call_type, CallType::Voice);
            call_id
        }
        other => panic!("expected incoming-call, got {other:?}"),
    };
    match alice.next_event().await {
        ServerEvent::CallInitiated {
            call_id: id,
            target_user,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(target_user.user_id, UserId::from("bob"));
        }
        other => panic!("expected call-initiated, got {other:?}"),
    }

    (alice, bob, alice_conn, bob_conn, call_id)
}

#[tokio::test]
async fn test_full_call_flow_with_negotiation() {
    let addr = spawn_relay().await;
    let (mut alice, mut bob, alice_conn, bob_conn, call_id) = ringing_call(addr).await;

    // Accept.
    bob.send(&ClientEvent::AcceptCall {
        call_id,
        target_socket_id: None,
    })
    .await;
    match alice.next_event().await {
        ServerEvent::CallAccepted { call_id: id, actor } => {
            assert_eq!(id, call_id);
            assert_eq!(actor.user_id, UserId::from("bob"));
        }
        other => panic!("expected call-accepted, got {other:?}"),
    }

    // Negotiation exchange: offer, answer, candidates, opaque both ways.
    alice
        .send(&ClientEvent::Offer {
            target: bob_conn,
            payload: serde_json::json!({ "sdp": "v=0 offer" }),
        })
        .await;
    match bob.next_event().await {
        ServerEvent::Offer { from, payload } => {
            assert_eq!(from, alice_conn);
            assert_eq!(payload["sdp"], "v=0 offer");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    bob.send(&ClientEvent::Answer {
        target: alice_conn,
        payload: serde_json::json!({ "sdp": "v=0 answer" }),
    })
    .await;
    match alice.next_event().await {
        ServerEvent::Answer { from, payload } => {
            assert_eq!(from, bob_conn);
            assert_eq!(payload["sdp"], "v=0 answer");
        }
        other => panic!("expected answer, got {other:?}"),
    }

    alice
        .send(&ClientEvent::IceCandidate {
            target: bob_conn,
            payload: serde_json::json!({ "candidate": "candidate:0" }),
        })
        .await;
    match bob.next_event().await {
        ServerEvent::IceCandidate { from, .. } => assert_eq!(from, alice_conn),
        other => panic!("expected ice-candidate, got {other:?}"),
    }

    // End.
    alice
        .send(&ClientEvent::EndCall {
            call_id,
            target_socket_id: None,
        })
        .await;
    match bob.next_event().await {
        ServerEvent::CallEnded {
            call_id: id,
            actor,
            reason,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(reason, EndReason::Ended);
            assert_eq!(actor.map(|a| a.user_id), Some(UserId::from("alice")));
        }
        other => panic!("expected call-ended, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_call_notifies_caller() {
    let addr = spawn_relay().await;
    let (mut alice, mut bob, _alice_conn, _bob_conn, call_id) = ringing_call(addr).await;

    bob.send(&ClientEvent::RejectCall {
        call_id,
        target_socket_id: None,
    })
    .await;

    match alice.next_event().await {
        ServerEvent::CallRejected { call_id: id, actor } => {
            assert_eq!(id, call_id);
            assert_eq!(actor.user_id, UserId::from("bob"));
        }
        other => panic!("expected call-rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_late_accept_after_end_is_an_error() {
    let addr = spawn_relay().await;
    let (mut alice, mut bob, _alice_conn, _bob_conn, call_id) = ringing_call(addr).await;

    alice
        .send(&ClientEvent::EndCall {
            call_id,
            target_socket_id: None,
        })
        .await;
    match bob.next_event().await {
        ServerEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Ended),
        other => panic!("expected call-ended, got {other:?}"),
    }

    // Bob's accept raced the end and lost: he gets one error, alice
    // hears nothing.
    bob.send(&ClientEvent::AcceptCall {
        call_id,
        target_socket_id: None,
    })
    .await;
    match bob.next_event().await {
        ServerEvent::Error { message } => {
            assert_eq!(message, "Cannot accept a call in state ended");
        }
        other => panic!("expected error, got {other:?}"),
    }
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_peer_disconnect_ends_call_exactly_once() {
    let addr = spawn_relay().await;
    let (mut alice, mut bob, _alice_conn, _bob_conn, call_id) = ringing_call(addr).await;

    bob.send(&ClientEvent::AcceptCall {
        call_id,
        target_socket_id: None,
    })
    .await;
    match alice.next_event().await {
        ServerEvent::CallAccepted { .. } => {}
        other => panic!("expected call-accepted, got {other:?}"),
    }

    // Bob's transport drops mid-call.
    drop(bob);

    match alice.next_event().await {
        ServerEvent::CallEnded {
            call_id: id,
            actor,
            reason,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(reason, EndReason::PeerDisconnected);
            assert_eq!(actor.map(|a| a.user_id), Some(UserId::from("bob")));
        }
        other => panic!("expected call-ended, got {other:?}"),
    }
    match alice.next_event().await {
        ServerEvent::UserOffline(user) => assert_eq!(user.user_id, UserId::from("bob")),
        other => panic!("expected user-offline, got {other:?}"),
    }

    // Exactly one termination notice.
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_room_join_chat_and_leave() {
    let addr = spawn_relay().await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;

    alice.register("alice").await;
    bob.register("bob").await;
    alice.next_event().await; // user-online bob

    let room = RoomId::from("general");
    alice
        .send(&ClientEvent::JoinRoom {
            room_id: room.clone(),
            user_id: UserId::from("alice"),
        })
        .await;
    match alice.next_event().await {
        ServerEvent::JoinedRoom { members, .. } => assert_eq!(members.len(), 1),
        other => panic!("expected joined-room, got {other:?}"),
    }

    bob.send(&ClientEvent::JoinRoom {
        room_id: room.clone(),
        user_id: UserId::from("bob"),
    })
    .await;
    match bob.next_event().await {
        ServerEvent::JoinedRoom { members, .. } => assert_eq!(members.len(), 2),
        other => panic!("expected joined-room, got {other:?}"),
    }
    match alice.next_event().await {
        ServerEvent::UserJoined { user, .. } => assert_eq!(user.user_id, UserId::from("bob")),
        other => panic!("expected user-joined, got {other:?}"),
    }

    // Chat fan-out reaches both members, sender included.
    alice
        .send(&ClientEvent::SendMessage {
            room_id: room.clone(),
            message: "hello room".to_string(),
            message_type: "text".to_string(),
        })
        .await;
    for client in [&mut alice, &mut bob] {
        match client.next_event().await {
            ServerEvent::NewMessage(chat) => {
                assert_eq!(chat.content, "hello room");
                assert_eq!(chat.sender_id, UserId::from("alice"));
                assert_eq!(chat.message_type, "text");
            }
            other => panic!("expected new-message, got {other:?}"),
        }
    }

    bob.send(&ClientEvent::LeaveRoom {
        room_id: room,
        user_id: None,
    })
    .await;
    match alice.next_event().await {
        ServerEvent::UserLeft { user, .. } => assert_eq!(user.user_id, UserId::from("bob")),
        other => panic!("expected user-left, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let addr = spawn_relay().await;
    let mut alice = Client::connect(addr).await;

    alice.send_raw("{ not json").await;
    match alice.next_event().await {
        ServerEvent::Error { message } => assert_eq!(message, "Malformed event"),
        other => panic!("expected error, got {other:?}"),
    }

    // The connection is still usable.
    let users = alice.register("alice").await;
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn test_duplicate_user_id_routes_to_most_recent_connection() {
    let addr = spawn_relay().await;
    let mut first = Client::connect(addr).await;
    let mut second = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;

    first.register("alice").await;
    second.register("alice").await;

    let snapshot = bob.register("bob").await;
    assert_eq!(snapshot.len(), 2, "one identity per userId");
    second.next_event().await; // user-online bob

    bob.send(&ClientEvent::CallUser {
        target_user_id: UserId::from("alice"),
        call_type: CallType::Video,
    })
    .await;

    // The invitation lands on the most recent registration only.
    match second.next_event().await {
        ServerEvent::IncomingCall { call_type, .. } => assert_eq!(call_type, CallType::Video),
        other => panic!("expected incoming-call, got {other:?}"),
    }
    first.assert_quiet().await;
}
