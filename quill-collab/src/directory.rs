//! Room directory: maps room ids to live rooms.
//!
//! Rooms are created lazily on first join (or explicitly over HTTP) and are
//! discarded only after sitting empty for a grace period. The grace timer is
//! a [`CleanupTimer`] stored inside the room, so a rejoin can cancel it.
//!
//! Lock order is always directory, then room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::room::{Room, RoomId, RoomSettings, RoomSummary};

/// Default grace period before an empty room is discarded.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(60 * 60);

/// Name given to a room created without one.
pub fn default_room_name(id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("Room {prefix}")
}

/// Handle to a pending room cleanup. Cancelling or dropping it aborts the
/// underlying task.
#[derive(Debug)]
pub struct CleanupTimer {
    handle: JoinHandle<()>,
}

impl CleanupTimer {
    fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(self) {
        // Drop aborts.
    }
}

impl Drop for CleanupTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<Room>>>>,
    settings: RoomSettings,
    cleanup_grace: Duration,
}

impl RoomDirectory {
    pub fn new(settings: RoomSettings, cleanup_grace: Duration) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            settings,
            cleanup_grace,
        }
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn cleanup_grace(&self) -> Duration {
        self.cleanup_grace
    }

    /// Get or create the room for `id`.
    pub async fn get_or_create(&self, id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }
        self.create_room(id, None).await
    }

    /// Create the room for `id`, or return the existing one untouched.
    ///
    /// A new room starts with its grace timer armed, so a room nobody ever
    /// joins is discarded like one everybody left. The first join cancels it.
    pub async fn create_room(&self, id: &str, name: Option<&str>) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }

        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => default_room_name(id),
        };
        let room = Arc::new(Room::new(id, name, &self.settings));
        rooms.insert(id.to_string(), room.clone());
        log::info!("Created room {} ({})", id, room.name());
        self.schedule_cleanup_for(&room).await;
        room
    }

    pub async fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Summaries of every live room, oldest first.
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            summaries.push(room.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Arm the grace timer for room `id`. Returns `false` if the room is
    /// unknown, occupied, or closed.
    pub async fn schedule_cleanup(&self, id: &str) -> bool {
        match self.get_room(id).await {
            Some(room) => self.schedule_cleanup_for(&room).await,
            None => false,
        }
    }

    /// Arm the grace timer for a specific room instance.
    ///
    /// At fire time the room is removed only if the directory still maps its
    /// id to this same instance and it still has no members.
    pub async fn schedule_cleanup_for(&self, room: &Arc<Room>) -> bool {
        let rooms = self.rooms.clone();
        let weak = Arc::downgrade(room);
        let grace = self.cleanup_grace;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(room) = weak.upgrade() {
                remove_if_idle(&rooms, &room).await;
            }
        });

        let armed = room.arm_cleanup(CleanupTimer::new(handle)).await;
        if armed {
            log::debug!("Room {} empty, cleanup in {:?}", room.id(), grace);
        }
        armed
    }

    /// Remove room `id` now if it has no members.
    pub async fn remove_if_empty(&self, id: &str) -> bool {
        match self.get_room(id).await {
            Some(room) => remove_if_idle(&self.rooms, &room).await,
            None => false,
        }
    }

    /// Unmap `room` if `id` still points at this closed instance, so the
    /// next lookup creates a fresh room.
    pub(crate) async fn discard_closed(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if let Some(current) = rooms.get(room.id()) {
            if Arc::ptr_eq(current, room) && room.is_closed().await {
                rooms.remove(room.id());
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn map_room(&self, room: Arc<Room>) {
        self.rooms.write().await.insert(room.id().to_string(), room);
    }
}

async fn remove_if_idle(rooms: &RwLock<HashMap<RoomId, Arc<Room>>>, room: &Arc<Room>) -> bool {
    let mut rooms = rooms.write().await;
    match rooms.get(room.id()) {
        Some(current) if Arc::ptr_eq(current, room) => {}
        _ => return false,
    }
    if !room.close_if_idle().await {
        return false;
    }
    rooms.remove(room.id());
    log::info!("Removed idle room {}", room.id());
    true
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new(RoomSettings::default(), DEFAULT_CLEANUP_GRACE)
    }
}
