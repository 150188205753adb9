//! Integration tests: real server, real sockets.
//!
//! Each test binds the sync server to an ephemeral port and drives it with
//! `SyncClient`s or raw tokio-tungstenite sockets.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use quill_collab::assist::{AssistError, Assistant};
use quill_collab::client::{ClientEvent, SyncClient};
use quill_collab::operation;
use quill_collab::protocol::ServerMessage;
use quill_collab::{ServerConfig, SyncServer};

/// Start a server on a free port, return it with its WebSocket URL.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    start_server_with(SyncServer::new(config)).await
}

async fn start_server_with(server: SyncServer) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(server);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, url)
}

/// Connect a client, draining the initial Connected event.
async fn connect_client(url: &str) -> (SyncClient, Receiver<ClientEvent>) {
    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let first = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert!(matches!(first, Some(ClientEvent::Connected)));
    (client, events)
}

async fn next_message(events: &mut Receiver<ClientEvent>) -> ServerMessage {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Server(message))) => message,
        other => panic!("Expected a server message, got {other:?}"),
    }
}

async fn join(
    client: &SyncClient,
    events: &mut Receiver<ClientEvent>,
    room: &str,
    name: &str,
) -> quill_collab::protocol::RoomSnapshot {
    client.join_room(room, name).await.unwrap();
    match next_message(events).await {
        ServerMessage::RoomJoined(snapshot) => snapshot,
        other => panic!("Expected RoomJoined, got {other:?}"),
    }
}

// ─── Editing ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_editors_end_to_end() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (bob, mut bob_events) = connect_client(&url).await;

    // Alice joins a fresh room and sees the welcome text.
    let snapshot = join(&alice, &mut alice_events, "r1", "Alice").await;
    assert!(snapshot.content.starts_with("// Welcome"));
    assert_eq!(snapshot.users.len(), 1);
    let mut alice_doc = snapshot.content;

    // Bob joins: Alice hears about it, Bob sees both users.
    let snapshot = join(&bob, &mut bob_events, "r1", "Bob").await;
    let names: Vec<&str> = snapshot.users.iter().map(|u| u.display_name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
    let mut bob_doc = snapshot.content;

    match next_message(&mut alice_events).await {
        ServerMessage::UserJoined(user) => assert_eq!(user.display_name, "Bob"),
        other => panic!("Expected UserJoined, got {other:?}"),
    }

    // Alice inserts; Bob applies what he receives.
    alice.insert(0, "X").await.unwrap();
    alice_doc.insert(0, 'X');
    match next_message(&mut bob_events).await {
        ServerMessage::DocumentOperation(op) => {
            assert_eq!(op.author_name, "Alice");
            assert_eq!(op.revision, 1);
            bob_doc = operation::apply(&bob_doc, &op);
        }
        other => panic!("Expected DocumentOperation, got {other:?}"),
    }
    assert!(bob_doc.starts_with("X// Welcome"));
    assert_eq!(alice_doc, bob_doc);

    // Bob deletes it again; Alice applies.
    bob.delete(0, 1).await.unwrap();
    match next_message(&mut alice_events).await {
        ServerMessage::DocumentOperation(op) => {
            assert_eq!(op.author_name, "Bob");
            alice_doc = operation::apply(&alice_doc, &op);
        }
        other => panic!("Expected DocumentOperation, got {other:?}"),
    }
    assert!(alice_doc.starts_with("// Welcome"));
}

#[tokio::test]
async fn test_operations_arrive_in_order() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = connect_client(&url).await;
    let (bob, mut bob_events) = connect_client(&url).await;
    join(&alice, &mut alice_events, "order", "Alice").await;
    join(&bob, &mut bob_events, "order", "Bob").await;

    for i in 0..20 {
        alice.insert(0, &i.to_string()).await.unwrap();
    }
    for expected in 1..=20u64 {
        match next_message(&mut bob_events).await {
            ServerMessage::DocumentOperation(op) => assert_eq!(op.revision, expected),
            other => panic!("Expected DocumentOperation, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_rejoin_keeps_document_and_chat() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let (mut alice, mut alice_events) = connect_client(&url).await;
    join(&alice, &mut alice_events, "keep", "Alice").await;

    alice.insert(0, "draft ").await.unwrap();
    alice.send_chat("brb").await.unwrap();
    // The chat echo confirms both messages were applied.
    assert!(matches!(next_message(&mut alice_events).await, ServerMessage::ChatMessage(_)));
    alice.disconnect().await;

    // Wait for the server to process the leave.
    let room = server.directory().get_room("keep").await.unwrap();
    for _ in 0..50 {
        if room.user_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(room.user_count().await, 0);

    let (again, mut again_events) = connect_client(&url).await;
    let snapshot = join(&again, &mut again_events, "keep", "Alice").await;
    assert!(snapshot.content.starts_with("draft // Welcome"));
    assert_eq!(snapshot.revision, 1);
    assert_eq!(snapshot.chat_history.len(), 1);
    assert_eq!(snapshot.chat_history[0].content, "brb");
}

// ─── Robustness ──────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_messages_are_dropped() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    for garbage in [
        "not json",
        r#"{"event":"document-operation","data":{"type":"insert","position":0}}"#,
        r#"{"event":"chat-message","data":{"message":"   "}}"#,
    ] {
        tx.send(Message::Text(garbage.into())).await.unwrap();
    }

    // The connection still works afterwards.
    let join = r#"{"event":"join-room","data":{"roomId":"robust","userName":"Raw"}}"#;
    tx.send(Message::Text(join.into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), rx.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("Expected a text frame");
    };
    let message = ServerMessage::decode(text.as_str()).unwrap();
    assert!(matches!(message, ServerMessage::RoomJoined(ref s) if s.room_id == "robust"));

    let stats = server.stats().await;
    assert_eq!(stats.messages_received, 4);
    assert_eq!(stats.messages_dropped, 3);
}

#[tokio::test]
async fn test_binary_json_frames_accepted() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let join = br#"{"event":"join-room","data":{"roomId":"bin","userName":"Bytes"}}"#;
    tx.send(Message::Binary(join.to_vec().into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), rx.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(frame, Message::Text(_)));
}

#[tokio::test]
async fn test_ping_answered() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), rx.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(frame, Message::Pong(vec![1, 2, 3].into()));
}

#[tokio::test]
async fn test_disconnect_updates_stats() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let (mut client, _events) = connect_client(&url).await;
    assert_eq!(server.stats().await.active_connections, 1);

    client.disconnect().await;
    for _ in 0..50 {
        if server.stats().await.active_connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.total_connections, 1);
}

// ─── Assistance ──────────────────────────────────────────────────

struct StalledAssistant;

impl Assistant for StalledAssistant {
    fn suggest<'a>(
        &'a self,
        _context: &'a str,
        _position: usize,
    ) -> BoxFuture<'a, Result<String, AssistError>> {
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_assist_returns_suggestion() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (client, mut events) = connect_client(&url).await;

    client.request_assist(7, "const x = ").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::AiSuggestion(s) => {
            assert_eq!(s.position, 7);
            assert!(!s.suggestion.is_empty());
        }
        other => panic!("Expected AiSuggestion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_assist_timeout_reports_error() {
    let config = ServerConfig {
        assist_timeout: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let (_server, url) =
        start_server_with(SyncServer::with_assistant(config, Arc::new(StalledAssistant))).await;
    let (client, mut events) = connect_client(&url).await;

    client.request_assist(3, "").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::AiError(failure) => {
            assert_eq!(failure.position, 3);
            assert!(failure.message.contains("timed out"));
        }
        other => panic!("Expected AiError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_assist_busy_when_limit_reached() {
    let config = ServerConfig { max_pending_assists: 1, ..ServerConfig::default() };
    let (_server, url) =
        start_server_with(SyncServer::with_assistant(config, Arc::new(StalledAssistant))).await;
    let (client, mut events) = connect_client(&url).await;

    client.request_assist(1, "").await.unwrap();
    client.request_assist(2, "").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::AiError(failure) => assert_eq!(failure.position, 2),
        other => panic!("Expected AiError, got {other:?}"),
    }
}

// ─── HTTP side channel ───────────────────────────────────────────

#[tokio::test]
async fn test_room_created_over_http_is_joinable() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/rooms")
        .body(Body::from(r#"{"name":"Pairing"}"#))
        .unwrap();
    let response = server.http_router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let room_id = created["roomId"].as_str().unwrap().to_string();

    let (client, mut events) = connect_client(&url).await;
    let snapshot = join(&client, &mut events, &room_id, "Alice").await;
    assert_eq!(snapshot.room_name, "Pairing");

    let request = Request::builder().uri("/api/rooms").body(Body::empty()).unwrap();
    let response = server.http_router().oneshot(request).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let rooms: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(rooms[0]["id"], room_id.as_str());
    assert_eq!(rooms[0]["userCount"], 1);
}
