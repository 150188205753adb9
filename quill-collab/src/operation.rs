//! Text operations: insert/delete edits and their application to a buffer.
//!
//! Offsets and lengths are counted in Unicode scalar values (`char`), never
//! bytes, so an operation can never split a code point.
//!
//! Out-of-range offsets are clamped rather than rejected: an edit may reach
//! the server after the buffer already changed underneath it, and a clamped
//! edit keeps the room live.
//!
//! ```text
//! Insert { position: 3, text: "XY" }      Delete { position: 1, length: 2 }
//!
//!   a b c | d e          a | b c | d e
//!         ▲                  └─┬─┘
//!         XY                removed
//!   a b c X Y d e          a d e
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::ConnectionId;

/// Edit kind, as tagged on the wire (`"insert"` / `"delete"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
}

/// A validated edit request before the room stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }
}

/// A fully populated operation as applied by a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    /// Inserted text; empty for deletes.
    #[serde(rename = "content")]
    pub text: String,
    /// Removed unit count; zero for inserts.
    pub length: usize,
    pub origin_user: ConnectionId,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    /// Room sequence number, assigned on apply (0 = not yet applied).
    pub revision: u64,
}

impl Operation {
    /// Stamp an edit with a fresh id and the current time.
    pub fn new(edit: Edit, origin_user: ConnectionId, author_name: impl Into<String>) -> Self {
        let (kind, position, text, length) = match edit {
            Edit::Insert { position, text } => (OperationKind::Insert, position, text, 0),
            Edit::Delete { position, length } => {
                (OperationKind::Delete, position, String::new(), length)
            }
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            position,
            text,
            length,
            origin_user,
            author_name: author_name.into(),
            created_at: Utc::now(),
            revision: 0,
        }
    }

    pub fn insert(position: usize, text: impl Into<String>, origin_user: ConnectionId) -> Self {
        Self::new(Edit::Insert { position, text: text.into() }, origin_user, "")
    }

    pub fn delete(position: usize, length: usize, origin_user: ConnectionId) -> Self {
        Self::new(Edit::Delete { position, length }, origin_user, "")
    }

    /// Number of units this operation inserts (0 for deletes).
    pub fn inserted_len(&self) -> usize {
        match self.kind {
            OperationKind::Insert => self.text.chars().count(),
            OperationKind::Delete => 0,
        }
    }

    /// Clamp the operation against a buffer of `buffer_len` units.
    ///
    /// Inserts past the end become appends; a delete window is cut down to
    /// whatever part of it lies inside `[0, buffer_len]`.
    pub fn clamped(&self, buffer_len: usize) -> Operation {
        let mut op = self.clone();
        op.position = op.position.min(buffer_len);
        if op.kind == OperationKind::Delete {
            op.length = op.length.min(buffer_len - op.position);
        }
        op
    }

    /// Apply to `buffer` in place and return the operation as applied.
    pub fn apply_to(&self, buffer: &mut String) -> Operation {
        let op = self.clamped(buffer.chars().count());
        match op.kind {
            OperationKind::Insert => {
                let at = byte_offset(buffer, op.position);
                buffer.insert_str(at, &op.text);
            }
            OperationKind::Delete => {
                if op.length > 0 {
                    let start = byte_offset(buffer, op.position);
                    let end = byte_offset(buffer, op.position + op.length);
                    buffer.replace_range(start..end, "");
                }
            }
        }
        op
    }

    /// Rebase this operation over `applied`, which the room already applied.
    ///
    /// Only shifts when `applied` sits at or before this operation. A preceding
    /// delete pulls the position back, never past `applied.position`.
    pub fn transform(&self, applied: &Operation) -> Operation {
        let mut op = self.clone();
        if applied.position <= op.position {
            match applied.kind {
                OperationKind::Insert => op.position += applied.inserted_len(),
                OperationKind::Delete => {
                    op.position -= applied.length.min(op.position - applied.position);
                }
            }
        }
        op
    }
}

/// Apply `op` to `content`, returning the new buffer.
pub fn apply(content: &str, op: &Operation) -> String {
    let mut buffer = content.to_string();
    op.apply_to(&mut buffer);
    buffer
}

/// Byte offset of the `units`-th char, or the buffer end.
fn byte_offset(buffer: &str, units: usize) -> usize {
    buffer
        .char_indices()
        .nth(units)
        .map(|(i, _)| i)
        .unwrap_or(buffer.len())
}
