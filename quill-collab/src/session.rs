//! Connection sessions: which room each live connection is in.
//!
//! A session holds only a weak reference to its room; the directory owns
//! rooms. Routing helpers silently ignore connections without a session.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::directory::RoomDirectory;
use crate::operation::{Edit, Operation};
use crate::presence::{ConnectionId, Cursor, User};
use crate::protocol::{ChatMessage, CursorMoved, DocumentSync, LanguageChanged, RoomSnapshot};
use crate::room::{Room, RoomError, RoomEvent, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("room id must not be empty")]
    InvalidRoomId,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub room_id: RoomId,
    pub user: User,
    room: Weak<Room>,
}

impl Session {
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.upgrade()
    }
}

/// What a connection receives on a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    /// Room events after the snapshot. Filter with
    /// [`RoomEvent::is_visible_to`].
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    directory: Arc<RoomDirectory>,
}

impl SessionManager {
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// Join `room_id`, leaving the connection's current room first.
    pub async fn join(
        &self,
        conn: ConnectionId,
        room_id: &str,
        display_name: &str,
    ) -> Result<JoinOutcome, SessionError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(SessionError::InvalidRoomId);
        }

        if let Some(previous) = self.leave(conn).await {
            log::debug!("{} left previous room as {}", conn, previous.display_name);
        }

        // A room closed by its cleanup timer is normally already gone from
        // the directory; either way the retry resolves to a fresh one.
        let (room, joined) = loop {
            let room = self.directory.get_or_create(room_id).await;
            match room.join(conn, display_name).await {
                Ok(joined) => break (room, joined),
                Err(RoomError::Closed) => {
                    log::debug!("Room {} closed during join, retrying", room_id);
                    self.directory.discard_closed(&room).await;
                }
            }
        };

        self.sessions.write().await.insert(
            conn,
            Session {
                room_id: room_id.to_string(),
                user: joined.user.clone(),
                room: Arc::downgrade(&room),
            },
        );
        log::info!(
            "{} joined room {} as {}",
            conn,
            room_id,
            joined.user.display_name
        );

        Ok(JoinOutcome {
            snapshot: joined.snapshot,
            events: joined.events,
        })
    }

    /// Drop the connection's session and remove it from its room. An
    /// emptied room gets its cleanup timer armed.
    pub async fn leave(&self, conn: ConnectionId) -> Option<User> {
        let session = self.sessions.write().await.remove(&conn)?;
        let room = session.room()?;
        let departure = room.leave(conn).await?;

        log::info!(
            "{} left room {} ({} remaining)",
            conn,
            session.room_id,
            departure.remaining
        );
        if departure.remaining == 0 {
            self.directory.schedule_cleanup_for(&room).await;
        }
        Some(departure.user)
    }

    pub async fn session(&self, conn: ConnectionId) -> Option<Session> {
        self.sessions.read().await.get(&conn).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn room_of(&self, conn: ConnectionId) -> Option<Arc<Room>> {
        self.sessions.read().await.get(&conn)?.room()
    }

    pub async fn apply_operation(
        &self,
        conn: ConnectionId,
        edit: Edit,
        base_revision: Option<u64>,
    ) -> Option<Operation> {
        self.room_of(conn).await?.apply_operation(conn, edit, base_revision).await
    }

    pub async fn update_cursor(&self, conn: ConnectionId, cursor: Cursor) -> Option<CursorMoved> {
        self.room_of(conn).await?.update_cursor(conn, cursor).await
    }

    pub async fn change_language(
        &self,
        conn: ConnectionId,
        language: &str,
    ) -> Option<LanguageChanged> {
        self.room_of(conn).await?.change_language(conn, language).await
    }

    pub async fn post_chat_message(&self, conn: ConnectionId, content: &str) -> Option<ChatMessage> {
        self.room_of(conn).await?.post_chat_message(conn, content).await
    }

    /// Full document state of the connection's room.
    pub async fn document_sync(&self, conn: ConnectionId) -> Option<DocumentSync> {
        Some(self.room_of(conn).await?.document_sync().await)
    }
}
