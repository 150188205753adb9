//! JSON sync protocol between editor clients and the server.
//!
//! Every WebSocket frame carries one message:
//! ```text
//! { "event": "document-operation",
//!   "data":  { "type": "insert", "position": 0, "content": "X" } }
//! ```
//! `event` selects the variant, `data` holds its camelCase payload. Each
//! variant has a fixed field set; anything that fails to decode or
//! [`validate`](ClientMessage::validate) is dropped by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{Edit, Operation, OperationKind};
use crate::presence::{ConnectionId, Cursor, User};
use crate::room::RoomId;

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom(JoinRoom),
    DocumentOperation(OperationRequest),
    CursorPosition(CursorUpdate),
    LanguageChange(LanguageChange),
    ChatMessage(ChatPost),
    AiAssistance(AssistRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_name: String,
}

/// Raw edit as sent by a client. `content` is required for inserts and
/// `length` for deletes; see [`OperationRequest::into_edit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Room revision the client had seen; enables server-side rebasing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<u64>,
}

impl OperationRequest {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            content: Some(content.into()),
            length: None,
            base_revision: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            content: None,
            length: Some(length),
            base_revision: None,
        }
    }

    pub fn with_base_revision(mut self, revision: u64) -> Self {
        self.base_revision = Some(revision);
        self
    }

    /// Check the kind-specific required field and build the edit.
    pub fn into_edit(self) -> Result<Edit, ProtocolError> {
        match self.kind {
            OperationKind::Insert => {
                let text = self.content.ok_or(ProtocolError::MissingField("content"))?;
                Ok(Edit::Insert { position: self.position, text })
            }
            OperationKind::Delete => {
                let length = self.length.ok_or(ProtocolError::MissingField("length"))?;
                Ok(Edit::Delete { position: self.position, length })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub cursor: Cursor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageChange {
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPost {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistRequest {
    pub position: usize,
    #[serde(default)]
    pub context: String,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Field checks serde cannot express. Insert/delete payloads are
    /// checked separately by [`OperationRequest::into_edit`].
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::JoinRoom(join) if join.room_id.trim().is_empty() => {
                Err(ProtocolError::InvalidField("roomId"))
            }
            ClientMessage::LanguageChange(change) if change.language.trim().is_empty() => {
                Err(ProtocolError::InvalidField("language"))
            }
            ClientMessage::ChatMessage(post) if post.message.trim().is_empty() => {
                Err(ProtocolError::InvalidField("message"))
            }
            _ => Ok(()),
        }
    }

    /// Wire name of the message, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::DocumentOperation(_) => "document-operation",
            ClientMessage::CursorPosition(_) => "cursor-position",
            ClientMessage::LanguageChange(_) => "language-change",
            ClientMessage::ChatMessage(_) => "chat-message",
            ClientMessage::AiAssistance(_) => "ai-assistance",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    RoomJoined(RoomSnapshot),
    UserJoined(User),
    UserLeft(UserLeft),
    DocumentOperation(Operation),
    CursorPosition(CursorMoved),
    LanguageChange(LanguageChanged),
    ChatMessage(ChatMessage),
    AiSuggestion(Suggestion),
    AiError(AssistFailure),
    /// Full document state for a connection that fell behind the room.
    DocumentSync(DocumentSync),
}

/// Everything a joining connection needs to render the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub room_name: String,
    pub user_id: ConnectionId,
    pub content: String,
    pub language: String,
    pub revision: u64,
    pub users: Vec<User>,
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: ConnectionId,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoved {
    pub user_id: ConnectionId,
    pub user_name: String,
    pub color: String,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageChanged {
    pub language: String,
    pub user_id: ConnectionId,
    pub user_name: String,
}

/// Immutable chat entry, stamped by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub author_user_id: ConnectionId,
    pub author_name: String,
    pub author_color: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(author: &User, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_user_id: author.id,
            author_name: author.display_name.clone(),
            author_color: author.color.clone(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub position: usize,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistFailure {
    pub position: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSync {
    pub content: String,
    pub language: String,
    pub revision: u64,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
}
