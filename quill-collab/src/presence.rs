//! Presence: who is in a room and where their cursor sits.
//!
//! Every live connection gets a [`ConnectionId`]; inside a room that id is
//! also the user's id. The registry is owned by its room and is only ever
//! touched under the room lock, so it carries no synchronization of its own.
//!
//! Cursor updates are last-write-wins. Nothing here transforms cursors
//! against document edits; clients re-send their cursor after editing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Identifier of one live connection (and of the user it represents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Text cursor in editor coordinates (zero-based line and column).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

impl Cursor {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

// ───────────────────────────────────────────────────────────────────
// Display color
// ───────────────────────────────────────────────────────────────────

/// Stable `#rrggbb` color for a connection.
///
/// The hue comes from the id, with fixed saturation and lightness so every
/// color stays readable on both light and dark editor themes.
pub fn color_for(id: ConnectionId) -> String {
    let hue = (id.0.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

pub const ANONYMOUS: &str = "Anonymous";

/// A member of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: ConnectionId,
    pub display_name: String,
    pub color: String,
    pub cursor: Cursor,
    pub joined_at: DateTime<Utc>,
}

impl User {
    /// New member with a derived color and a zeroed cursor.
    ///
    /// Blank names fall back to [`ANONYMOUS`].
    pub fn new(id: ConnectionId, display_name: &str) -> Self {
        let name = display_name.trim();
        Self {
            id,
            display_name: if name.is_empty() { ANONYMOUS.to_string() } else { name.to_string() },
            color: color_for(id),
            cursor: Cursor::default(),
            joined_at: Utc::now(),
        }
    }
}

/// Members of one room, keyed by connection.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: HashMap<ConnectionId, User>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; replaces any previous entry for the same connection.
    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<User> {
        self.users.remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&User> {
        self.users.get(id)
    }

    /// Overwrite a member's cursor. Returns the updated user, or `None` for
    /// a connection that is not a member.
    pub fn update_cursor(&mut self, id: &ConnectionId, cursor: Cursor) -> Option<&User> {
        let user = self.users.get_mut(id)?;
        user.cursor = cursor;
        Some(user)
    }

    /// All members, oldest first.
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by_key(|u| u.joined_at);
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
