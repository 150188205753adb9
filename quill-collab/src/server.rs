//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room "r1" ── Document
//!            ├── SessionManager ────┤      │
//! Client B ──┘        │             │      └── broadcast ──► A, B
//!                     │             └── Room "r2" ...
//!                     ▼
//!               RoomDirectory ◄──── HTTP side channel (axum)
//! ```
//!
//! Each connection runs one task that multiplexes three sources with
//! `tokio::select!`: frames from the socket, events from its room, and
//! finished assistance requests. The room snapshot on join is written to
//! the socket directly, ahead of any room event.

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::assist::{suggest_within, AssistError, Assistant, MockAssistant};
use crate::config::ServerConfig;
use crate::directory::RoomDirectory;
use crate::http::{self, HttpState};
use crate::presence::ConnectionId;
use crate::protocol::{
    AssistFailure, AssistRequest, ClientMessage, ProtocolError, ServerMessage, Suggestion,
};
use crate::room::RoomEvent;
use crate::session::SessionManager;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

/// Lock-free connection counters, read via [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct ConnectionStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_rooms: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}

/// Everything one connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    sessions: Arc<SessionManager>,
    assistant: Arc<dyn Assistant>,
    stats: Arc<ConnectionStats>,
    assist_timeout: Duration,
    max_pending_assists: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    directory: Arc<RoomDirectory>,
    sessions: Arc<SessionManager>,
    assistant: Arc<dyn Assistant>,
    stats: Arc<ConnectionStats>,
}

impl SyncServer {
    /// Create a server backed by the mock assistant.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_assistant(config, Arc::new(MockAssistant::new()))
    }

    pub fn with_assistant(config: ServerConfig, assistant: Arc<dyn Assistant>) -> Self {
        let directory = Arc::new(RoomDirectory::new(config.room_settings(), config.cleanup_grace));
        let sessions = Arc::new(SessionManager::new(directory.clone()));
        Self {
            config,
            directory,
            sessions,
            assistant,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind both listeners and serve until the WebSocket listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let http_listener = TcpListener::bind(&self.config.http_addr).await?;
        log::info!("HTTP side channel listening on {}", self.config.http_addr);
        let router = self.http_router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router).await {
                log::error!("HTTP side channel stopped: {e}");
            }
        });

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.context();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            sessions: self.sessions.clone(),
            assistant: self.assistant.clone(),
            stats: self.stats.clone(),
            assist_timeout: self.config.assist_timeout,
            max_pending_assists: self.config.max_pending_assists,
        }
    }

    /// Router for the HTTP side channel.
    pub fn http_router(&self) -> axum::Router {
        http::router(HttpState {
            directory: self.directory.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn = ConnectionId::new();
        ctx.stats.connection_opened();
        log::info!("WebSocket connection {conn} established from {addr}");

        let result = Self::connection_loop(conn, &mut ws_sender, &mut ws_receiver, &ctx).await;

        // Cleanup: leave the room, in-flight assists die with the loop
        ctx.sessions.leave(conn).await;
        ctx.stats.connection_closed();
        log::info!("Connection {conn} from {addr} closed");
        result
    }

    async fn connection_loop<S, R>(
        conn: ConnectionId,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        ctx: &ConnectionContext,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut events: Option<broadcast::Receiver<Arc<RoomEvent>>> = None;
        let mut assists: JoinSet<ServerMessage> = JoinSet::new();

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                ctx.stats.message_dropped();
                                log::warn!("Dropping non-UTF-8 binary frame from {conn}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on {conn}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    ctx.stats.message_received();
                    let message = match ClientMessage::decode(&text).and_then(|m| m.validate().map(|_| m)) {
                        Ok(message) => message,
                        Err(e) => {
                            ctx.stats.message_dropped();
                            log::warn!("Dropping malformed message from {conn}: {e}");
                            continue;
                        }
                    };
                    ctx.handle_message(conn, message, ws_sender, &mut events, &mut assists).await?;
                }

                // Outgoing room event
                event = next_event(&mut events) => {
                    match event {
                        Ok(event) => {
                            if event.is_visible_to(conn) {
                                send_message(ws_sender, &event.message).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn} lagged by {n} room events, resyncing");
                            if let Some(sync) = ctx.sessions.document_sync(conn).await {
                                send_message(ws_sender, &ServerMessage::DocumentSync(sync)).await?;
                            }
                        }
                        Err(RecvError::Closed) => events = None,
                    }
                }

                // Finished assistance request
                Some(done) = assists.join_next(), if !assists.is_empty() => {
                    match done {
                        Ok(reply) => send_message(ws_sender, &reply).await?,
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => log::error!("Assistance task for {conn} failed: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.directory.room_count().await)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

impl ConnectionContext {
    async fn handle_message<S>(
        &self,
        conn: ConnectionId,
        message: ClientMessage,
        ws_sender: &mut S,
        events: &mut Option<broadcast::Receiver<Arc<RoomEvent>>>,
        assists: &mut JoinSet<ServerMessage>,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        log::debug!("{} from {}", message.event_name(), conn);
        match message {
            ClientMessage::JoinRoom(join) => {
                match self.sessions.join(conn, &join.room_id, &join.user_name).await {
                    Ok(outcome) => {
                        *events = Some(outcome.events);
                        send_message(ws_sender, &ServerMessage::RoomJoined(outcome.snapshot)).await?;
                    }
                    Err(e) => {
                        self.stats.message_dropped();
                        log::warn!("Join from {conn} rejected: {e}");
                    }
                }
            }
            ClientMessage::DocumentOperation(request) => {
                let base_revision = request.base_revision;
                match request.into_edit() {
                    Ok(edit) => {
                        if self.sessions.apply_operation(conn, edit, base_revision).await.is_none() {
                            log::debug!("Ignoring operation from {conn}: not in a room");
                        }
                    }
                    Err(e) => {
                        self.stats.message_dropped();
                        log::warn!("Dropping operation from {conn}: {e}");
                    }
                }
            }
            ClientMessage::CursorPosition(update) => {
                if self.sessions.update_cursor(conn, update.cursor).await.is_some() {
                    log::trace!("Cursor of {conn} at {:?}", update.cursor);
                }
            }
            ClientMessage::LanguageChange(change) => {
                if let Some(changed) = self.sessions.change_language(conn, &change.language).await {
                    log::info!("{} switched language to {}", changed.user_name, changed.language);
                }
            }
            ClientMessage::ChatMessage(post) => {
                self.sessions.post_chat_message(conn, &post.message).await;
            }
            ClientMessage::AiAssistance(request) => {
                if assists.len() >= self.max_pending_assists {
                    let busy = ServerMessage::AiError(AssistFailure {
                        position: request.position,
                        message: AssistError::Busy.to_string(),
                    });
                    send_message(ws_sender, &busy).await?;
                } else {
                    assists.spawn(self.assist(conn, request));
                }
            }
        }
        Ok(())
    }

    fn assist(
        &self,
        conn: ConnectionId,
        request: AssistRequest,
    ) -> impl std::future::Future<Output = ServerMessage> + Send + 'static {
        let assistant = self.assistant.clone();
        let timeout = self.assist_timeout;
        async move {
            let position = request.position;
            match suggest_within(assistant.as_ref(), &request.context, position, timeout).await {
                Ok(suggestion) => ServerMessage::AiSuggestion(Suggestion { position, suggestion }),
                Err(e) => {
                    log::warn!("Assistance for {conn} failed: {e}");
                    ServerMessage::AiError(AssistFailure { position, message: e.to_string() })
                }
            }
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<Arc<RoomEvent>>>,
) -> Result<Arc<RoomEvent>, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        // Not in a room yet: wait forever
        None => std::future::pending().await,
    }
}

async fn send_message<S>(ws_sender: &mut S, message: &ServerMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = message.encode()?;
    ws_sender.send(Message::Text(encoded.into())).await?;
    Ok(())
}
