//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed senders for every client message
//! - A stream of [`ClientEvent`]s carrying decoded server messages
//!
//! The client tracks the last room revision it has observed, so callers can
//! opt into server-side rebasing with
//! [`OperationRequest::with_base_revision`].

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::{ConnectionId, Cursor};
use crate::protocol::{
    AssistRequest, ChatPost, ClientMessage, CursorUpdate, JoinRoom, LanguageChange,
    OperationRequest, ProtocolError, ServerMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A message from the server
    Server(ServerMessage),
}

/// The sync client.
pub struct SyncClient {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Last room revision seen in a snapshot, operation, or resync
    revision: Arc<AtomicU64>,

    /// Our id, learned from `room-joined`
    user_id: Arc<RwLock<Option<ConnectionId>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            revision: Arc::new(AtomicU64::new(0)),
            user_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when
        // the client drops its sender.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode incoming frames
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let revision = self.revision.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let message = match frame {
                    Ok(Message::Text(text)) => ServerMessage::decode(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Ignoring undecodable server message: {e}");
                        continue;
                    }
                };

                match &message {
                    ServerMessage::RoomJoined(snapshot) => {
                        revision.store(snapshot.revision, Ordering::SeqCst);
                        *user_id.write().await = Some(snapshot.user_id);
                    }
                    ServerMessage::DocumentOperation(op) => {
                        revision.fetch_max(op.revision, Ordering::SeqCst);
                    }
                    ServerMessage::DocumentSync(sync) => {
                        revision.store(sync.revision, Ordering::SeqCst);
                    }
                    _ => {}
                }

                if event_tx.send(ClientEvent::Server(message)).await.is_err() {
                    break;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The server treats this as leaving the room.
    pub async fn disconnect(&mut self) {
        // Dropping the sender makes the writer task send a close frame.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send any client message.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = message.encode()?;

        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn join_room(&self, room_id: &str, user_name: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom(JoinRoom {
            room_id: room_id.to_string(),
            user_name: user_name.to_string(),
        }))
        .await
    }

    pub async fn send_operation(&self, request: OperationRequest) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::DocumentOperation(request)).await
    }

    pub async fn insert(&self, position: usize, text: &str) -> Result<(), ProtocolError> {
        self.send_operation(OperationRequest::insert(position, text)).await
    }

    pub async fn delete(&self, position: usize, length: usize) -> Result<(), ProtocolError> {
        self.send_operation(OperationRequest::delete(position, length)).await
    }

    pub async fn move_cursor(&self, cursor: Cursor) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CursorPosition(CursorUpdate { cursor })).await
    }

    pub async fn change_language(&self, language: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LanguageChange(LanguageChange {
            language: language.to_string(),
        }))
        .await
    }

    pub async fn send_chat(&self, message: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ChatMessage(ChatPost { message: message.to_string() })).await
    }

    pub async fn request_assist(&self, position: usize, context: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::AiAssistance(AssistRequest {
            position,
            context: context.to_string(),
        }))
        .await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Last room revision observed.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Our id in the current room, once joined.
    pub async fn user_id(&self) -> Option<ConnectionId> {
        *self.user_id.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
