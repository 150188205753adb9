//! A room: one shared document, its members, and its chat log.
//!
//! ```text
//!  conn A ──┐                       ┌──► conn A  (echo events only)
//!           │   ┌───────────────┐   │
//!  conn B ──┼──►│ Mutex<State>  │───┼──► conn B
//!           │   │  document     │   │
//!  conn C ──┘   │  presence     │   └──► conn C
//!               │  chat log     │
//!               └──────┬────────┘
//!                      │ publish while locked
//!                      ▼
//!              broadcast::Sender<RoomEvent>
//! ```
//!
//! Every mutation takes the room lock, applies, and publishes its event
//! before releasing it, so the event stream is in application order. Rooms
//! never share a lock with each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::directory::CleanupTimer;
use crate::document::{Document, DEFAULT_LANGUAGE, DEFAULT_WELCOME_TEXT};
use crate::operation::{Edit, Operation};
use crate::presence::{ConnectionId, Cursor, PresenceRegistry, User};
use crate::protocol::{
    ChatMessage, CursorMoved, DocumentSync, LanguageChanged, RoomSnapshot, ServerMessage, UserLeft,
};

pub type RoomId = String;

/// Per-room settings, shared by every room a directory creates.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub welcome_text: String,
    pub default_language: String,
    /// Events buffered per member before a slow member starts lagging.
    pub broadcast_capacity: usize,
    /// Chat messages kept; older ones are evicted first.
    pub chat_history_limit: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            welcome_text: DEFAULT_WELCOME_TEXT.to_string(),
            default_language: DEFAULT_LANGUAGE.to_string(),
            broadcast_capacity: 256,
            chat_history_limit: 1000,
        }
    }
}

/// One entry of a room's event stream.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    /// Connection whose request produced the event.
    pub origin: ConnectionId,
    /// Whether the origin receives the event too.
    pub echo: bool,
    pub message: ServerMessage,
}

impl RoomEvent {
    pub fn is_visible_to(&self, conn: ConnectionId) -> bool {
        self.echo || self.origin != conn
    }
}

/// Room listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub user_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// The directory removed this room; resolve the id again.
    #[error("room is closed")]
    Closed,
}

/// Result of a successful join.
#[derive(Debug)]
pub struct Joined {
    pub user: User,
    pub snapshot: RoomSnapshot,
    /// Events applied after `snapshot`, in order.
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
}

/// Result of a leave.
#[derive(Debug, Clone)]
pub struct Departure {
    pub user: User,
    /// Members left in the room.
    pub remaining: usize,
}

struct RoomState {
    document: Document,
    presence: PresenceRegistry,
    chat_log: VecDeque<ChatMessage>,
    last_activity_at: DateTime<Utc>,
    closed: bool,
    cleanup: Option<CleanupTimer>,
}

impl RoomState {
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

pub struct Room {
    id: RoomId,
    name: String,
    created_at: DateTime<Utc>,
    chat_history_limit: usize,
    state: Mutex<RoomState>,
    events: broadcast::Sender<Arc<RoomEvent>>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, name: impl Into<String>, settings: &RoomSettings) -> Self {
        let (events, _) = broadcast::channel(settings.broadcast_capacity.max(1));
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            created_at: now,
            chat_history_limit: settings.chat_history_limit,
            state: Mutex::new(RoomState {
                document: Document::new(
                    settings.welcome_text.clone(),
                    settings.default_language.clone(),
                ),
                presence: PresenceRegistry::new(),
                chat_log: VecDeque::new(),
                last_activity_at: now,
                closed: false,
                cleanup: None,
            }),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Raw event stream, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.events.subscribe()
    }

    fn publish(&self, origin: ConnectionId, echo: bool, message: ServerMessage) {
        // No receivers is fine: nobody is listening right now.
        let _ = self.events.send(Arc::new(RoomEvent { origin, echo, message }));
    }

    fn snapshot(&self, state: &RoomState, conn: ConnectionId) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            user_id: conn,
            content: state.document.content().to_string(),
            language: state.document.language().to_string(),
            revision: state.document.revision(),
            users: state.presence.users(),
            chat_history: state.chat_log.iter().cloned().collect(),
        }
    }

    /// Add `conn` as a member, cancelling any pending cleanup.
    ///
    /// The returned receiver is subscribed under the room lock, so it yields
    /// exactly the events applied after the snapshot.
    pub async fn join(&self, conn: ConnectionId, display_name: &str) -> Result<Joined, RoomError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }
        if let Some(timer) = state.cleanup.take() {
            timer.cancel();
            log::debug!("Cancelled pending cleanup of room {}", self.id);
        }

        let user = User::new(conn, display_name);
        let events = self.events.subscribe();
        state.presence.insert(user.clone());
        state.touch();
        self.publish(conn, false, ServerMessage::UserJoined(user.clone()));

        let snapshot = self.snapshot(&state, conn);
        Ok(Joined { user, snapshot, events })
    }

    /// Remove `conn`. `None` if it was not a member.
    pub async fn leave(&self, conn: ConnectionId) -> Option<Departure> {
        let mut state = self.state.lock().await;
        let user = state.presence.remove(&conn)?;
        state.touch();
        self.publish(
            conn,
            false,
            ServerMessage::UserLeft(UserLeft {
                user_id: user.id,
                user_name: user.display_name.clone(),
            }),
        );
        Some(Departure { user, remaining: state.presence.len() })
    }

    /// Apply an edit from a member, in arrival order.
    ///
    /// With `base_revision` behind the room, the edit is first rebased over
    /// the operations other members applied since. Returns the operation as
    /// applied, or `None` if `conn` is not a member.
    pub async fn apply_operation(
        &self,
        conn: ConnectionId,
        edit: Edit,
        base_revision: Option<u64>,
    ) -> Option<Operation> {
        let mut state = self.state.lock().await;
        let author = state.presence.get(&conn)?.display_name.clone();

        let mut op = Operation::new(edit, conn, author);
        if let Some(base) = base_revision {
            if base < state.document.revision() {
                op = state.document.rebase(&op, base);
            }
        }
        let applied = state.document.apply(&op);
        state.touch();
        self.publish(conn, false, ServerMessage::DocumentOperation(applied.clone()));
        Some(applied)
    }

    /// Last-write-wins cursor update.
    pub async fn update_cursor(&self, conn: ConnectionId, cursor: Cursor) -> Option<CursorMoved> {
        let mut state = self.state.lock().await;
        let user = state.presence.update_cursor(&conn, cursor)?;
        let moved = CursorMoved {
            user_id: user.id,
            user_name: user.display_name.clone(),
            color: user.color.clone(),
            cursor,
        };
        state.touch();
        self.publish(conn, false, ServerMessage::CursorPosition(moved.clone()));
        Some(moved)
    }

    /// Set the document language; echoed to the sender as well.
    pub async fn change_language(
        &self,
        conn: ConnectionId,
        language: &str,
    ) -> Option<LanguageChanged> {
        let mut state = self.state.lock().await;
        let user_name = state.presence.get(&conn)?.display_name.clone();
        state.document.set_language(language);
        state.touch();

        let changed = LanguageChanged {
            language: language.to_string(),
            user_id: conn,
            user_name,
        };
        self.publish(conn, true, ServerMessage::LanguageChange(changed.clone()));
        Some(changed)
    }

    /// Append a chat message; echoed to the sender as well.
    pub async fn post_chat_message(&self, conn: ConnectionId, content: &str) -> Option<ChatMessage> {
        let mut state = self.state.lock().await;
        let message = ChatMessage::new(state.presence.get(&conn)?, content);

        state.chat_log.push_back(message.clone());
        while state.chat_log.len() > self.chat_history_limit {
            state.chat_log.pop_front();
        }
        state.touch();
        self.publish(conn, true, ServerMessage::ChatMessage(message.clone()));
        Some(message)
    }

    pub async fn document_sync(&self) -> DocumentSync {
        let state = self.state.lock().await;
        DocumentSync {
            content: state.document.content().to_string(),
            language: state.document.language().to_string(),
            revision: state.document.revision(),
        }
    }

    pub async fn content(&self) -> String {
        self.state.lock().await.document.content().to_string()
    }

    pub async fn language(&self) -> String {
        self.state.lock().await.document.language().to_string()
    }

    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        self.state.lock().await.chat_log.iter().cloned().collect()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.presence.users()
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.presence.len()
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.lock().await.last_activity_at
    }

    pub async fn summary(&self) -> RoomSummary {
        let state = self.state.lock().await;
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            user_count: state.presence.len(),
            created_at: self.created_at,
            last_activity_at: state.last_activity_at,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn has_pending_cleanup(&self) -> bool {
        self.state.lock().await.cleanup.is_some()
    }

    /// Store a cleanup timer, replacing (and aborting) any previous one.
    /// Refused, and the timer aborted, if the room has members or is closed.
    pub(crate) async fn arm_cleanup(&self, timer: CleanupTimer) -> bool {
        let mut state = self.state.lock().await;
        if state.closed || !state.presence.is_empty() {
            timer.cancel();
            return false;
        }
        state.cleanup = Some(timer);
        true
    }

    /// Mark the room closed if it has no members. Only the directory calls
    /// this, while holding its own write lock.
    pub(crate) async fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.presence.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn room() -> Room {
        Room::new("r1", "Room r1", &RoomSettings::default())
    }

    fn next_message(rx: &mut broadcast::Receiver<Arc<RoomEvent>>) -> Arc<RoomEvent> {
        rx.try_recv().expect("expected a room event")
    }

    #[tokio::test]
    async fn test_new_room_has_welcome_document() {
        let room = room();
        assert!(room.content().await.starts_with("// Welcome"));
        assert_eq!(room.language().await, DEFAULT_LANGUAGE);
        assert_eq!(room.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_snapshot_includes_joiner() {
        let room = room();
        let alice = ConnectionId::new();
        let joined = room.join(alice, "Alice").await.unwrap();

        assert_eq!(joined.snapshot.user_id, alice);
        assert_eq!(joined.snapshot.users.len(), 1);
        assert_eq!(joined.snapshot.users[0].display_name, "Alice");
        assert_eq!(joined.snapshot.revision, 0);
    }

    #[tokio::test]
    async fn test_join_event_hidden_from_joiner() {
        let room = room();
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        let mut alice_rx = room.join(alice, "Alice").await.unwrap().events;
        let mut bob_rx = room.join(bob, "Bob").await.unwrap().events;

        let event = next_message(&mut alice_rx);
        assert!(event.is_visible_to(alice));
        assert!(matches!(&event.message, ServerMessage::UserJoined(u) if u.display_name == "Bob"));

        // Bob's stream starts with his own join, which he must filter out.
        let own = next_message(&mut bob_rx);
        assert!(!own.is_visible_to(bob));
    }

    #[tokio::test]
    async fn test_apply_operation_broadcasts_in_order() {
        let room = room();
        let alice = ConnectionId::new();
        let mut rx = room.join(alice, "Alice").await.unwrap().events;
        let _ = next_message(&mut rx); // own join

        let first = room
            .apply_operation(alice, Edit::Insert { position: 0, text: "X".into() }, None)
            .await
            .unwrap();
        let second = room
            .apply_operation(alice, Edit::Delete { position: 0, length: 1 }, None)
            .await
            .unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(first.author_name, "Alice");

        for expected in [first, second] {
            let event = next_message(&mut rx);
            assert!(!event.is_visible_to(alice));
            assert_eq!(event.message, ServerMessage::DocumentOperation(expected));
        }
        assert!(room.content().await.starts_with("// Welcome"));
    }

    #[tokio::test]
    async fn test_non_member_mutations_are_ignored() {
        let room = room();
        let stranger = ConnectionId::new();
        let mut rx = room.subscribe();

        assert!(room
            .apply_operation(stranger, Edit::Insert { position: 0, text: "x".into() }, None)
            .await
            .is_none());
        assert!(room.update_cursor(stranger, Cursor::new(1, 1)).await.is_none());
        assert!(room.change_language(stranger, "go").await.is_none());
        assert!(room.post_chat_message(stranger, "hi").await.is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_base_revision_rebases() {
        let room = Room::new(
            "r",
            "r",
            &RoomSettings { welcome_text: "abcdef".into(), ..RoomSettings::default() },
        );
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();
        room.join(bob, "Bob").await.unwrap();

        room.apply_operation(bob, Edit::Insert { position: 0, text: "12".into() }, Some(0))
            .await
            .unwrap();
        // Alice still thinks the buffer is "abcdef" and appends at 6.
        let applied = room
            .apply_operation(alice, Edit::Insert { position: 6, text: "!".into() }, Some(0))
            .await
            .unwrap();

        assert_eq!(applied.position, 8);
        assert_eq!(room.content().await, "12abcdef!");
    }

    #[tokio::test]
    async fn test_rebase_accounts_for_own_earlier_edits() {
        let room = Room::new(
            "r",
            "r",
            &RoomSettings { welcome_text: "abcdef".into(), ..RoomSettings::default() },
        );
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();
        room.join(bob, "Bob").await.unwrap();

        room.apply_operation(bob, Edit::Insert { position: 4, text: "YY".into() }, Some(0))
            .await
            .unwrap();
        room.apply_operation(alice, Edit::Insert { position: 0, text: "XX".into() }, Some(0))
            .await
            .unwrap();
        // Alice's buffer is "XXabcdef"; 5 is just before 'd'.
        room.apply_operation(alice, Edit::Insert { position: 5, text: "Z".into() }, Some(0))
            .await
            .unwrap();

        assert_eq!(room.content().await, "XXabcZdYYef");
    }

    #[tokio::test]
    async fn test_without_base_revision_fifo_applies_raw() {
        let room = Room::new(
            "r",
            "r",
            &RoomSettings { welcome_text: "abcdef".into(), ..RoomSettings::default() },
        );
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();
        room.join(bob, "Bob").await.unwrap();

        room.apply_operation(bob, Edit::Insert { position: 0, text: "12".into() }, None)
            .await
            .unwrap();
        room.apply_operation(alice, Edit::Insert { position: 6, text: "!".into() }, None)
            .await
            .unwrap();
        assert_eq!(room.content().await, "12abcd!ef");
    }

    #[tokio::test]
    async fn test_chat_and_language_echo() {
        let room = room();
        let alice = ConnectionId::new();
        let mut rx = room.join(alice, "Alice").await.unwrap().events;
        let _ = next_message(&mut rx);

        room.change_language(alice, "rust").await.unwrap();
        let chat = room.post_chat_message(alice, "hello").await.unwrap();

        assert!(next_message(&mut rx).is_visible_to(alice));
        let event = next_message(&mut rx);
        assert!(event.is_visible_to(alice));
        assert_eq!(event.message, ServerMessage::ChatMessage(chat));
        assert_eq!(room.language().await, "rust");
    }

    #[tokio::test]
    async fn test_chat_history_is_bounded() {
        let room = Room::new(
            "r",
            "r",
            &RoomSettings { chat_history_limit: 2, ..RoomSettings::default() },
        );
        let alice = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();
        for text in ["one", "two", "three"] {
            room.post_chat_message(alice, text).await.unwrap();
        }

        let history: Vec<String> =
            room.chat_history().await.into_iter().map(|m| m.content).collect();
        assert_eq!(history, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_cursor_update() {
        let room = room();
        let alice = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();

        let moved = room.update_cursor(alice, Cursor::new(2, 5)).await.unwrap();
        assert_eq!(moved.cursor, Cursor::new(2, 5));
        assert_eq!(room.users().await[0].cursor, Cursor::new(2, 5));
    }

    #[tokio::test]
    async fn test_leave_reports_remaining() {
        let room = room();
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        room.join(alice, "Alice").await.unwrap();
        room.join(bob, "Bob").await.unwrap();

        assert_eq!(room.leave(alice).await.unwrap().remaining, 1);
        assert!(room.leave(alice).await.is_none());
        assert_eq!(room.leave(bob).await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_closed_room_refuses_joins() {
        let room = room();
        assert!(room.close_if_idle().await);
        assert_eq!(room.join(ConnectionId::new(), "Late").await.unwrap_err(), RoomError::Closed);
    }

    #[tokio::test]
    async fn test_close_refused_with_members() {
        let room = room();
        room.join(ConnectionId::new(), "Alice").await.unwrap();
        assert!(!room.close_if_idle().await);
        assert!(!room.is_closed().await);
    }
}
