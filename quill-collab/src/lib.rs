//! # quill-collab: Real-time collaborative code editing
//!
//! Rooms hold one shared text document. Connected editors send insert and
//! delete operations over WebSocket; the server applies them in arrival
//! order and fans them out to everyone else in the room, together with
//! cursor presence, language changes, and chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer   │
//! │ (per user)  │     JSON events     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ SessionManager │
//!                                    └───────┬────────┘
//!                                            │
//!                                    ┌───────┴────────┐      ┌───────────┐
//!                                    │ RoomDirectory  │ ◄────│ HTTP API  │
//!                                    └───────┬────────┘      └───────────┘
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                            Room          Room          Room
//!                    (document, presence, chat, broadcast)
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert/delete operations and their application
//! - [`document`]: Document text, language, and applied-operation log
//! - [`presence`]: Room members and cursors
//! - [`room`]: One room's serialized state and event stream
//! - [`directory`]: Room lookup, lazy creation, and idle cleanup
//! - [`session`]: Connection to room bindings
//! - [`protocol`]: JSON wire messages
//! - [`assist`]: Code suggestion provider seam
//! - [`server`]: WebSocket sync server
//! - [`http`]: HTTP side channel
//! - [`client`]: WebSocket sync client
//! - [`config`]: Server configuration

pub mod assist;
pub mod client;
pub mod config;
pub mod directory;
pub mod document;
pub mod http;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use assist::{AssistError, Assistant, MockAssistant};
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use config::{ConfigError, ServerConfig};
pub use directory::{CleanupTimer, RoomDirectory};
pub use document::Document;
pub use operation::{Edit, Operation, OperationKind};
pub use presence::{ConnectionId, Cursor, PresenceRegistry, User};
pub use protocol::{ClientMessage, OperationRequest, ProtocolError, ServerMessage};
pub use room::{Room, RoomError, RoomEvent, RoomId, RoomSettings, RoomSummary};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{JoinOutcome, SessionError, SessionManager};
