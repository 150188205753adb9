//! HTTP side channel: room listing, room creation, and server stats.
//!
//! Stateless request/response endpoints next to the WebSocket protocol:
//!
//! - `GET  /api/rooms`     list live rooms
//! - `POST /api/rooms`     create a room, body `{"name"?: string}` or empty
//! - `GET  /api/rooms/:id` one room, 404 if unknown
//! - `GET  /api/stats`     connection and room counters

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::directory::RoomDirectory;
use crate::room::RoomSummary;
use crate::server::{ConnectionStats, ServerStats};

#[derive(Clone)]
pub struct HttpState {
    pub directory: Arc<RoomDirectory>,
    pub stats: Arc<ConnectionStats>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:id", get(get_room))
        .route("/api/stats", get(get_stats))
        .with_state(state)
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    pub room_id: String,
    pub name: String,
}

/// GET /api/rooms
async fn list_rooms(State(state): State<HttpState>) -> Json<Vec<RoomSummary>> {
    Json(state.directory.list_rooms().await)
}

/// POST /api/rooms
///
/// The body is optional, so it is taken raw rather than through `Json`.
async fn create_room(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<CreatedRoom>, ApiError> {
    let request: CreateRoomRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRoomRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };

    let id = Uuid::new_v4().to_string();
    let room = state.directory.create_room(&id, request.name.as_deref()).await;
    Ok(Json(CreatedRoom {
        room_id: room.id().to_string(),
        name: room.name().to_string(),
    }))
}

/// GET /api/rooms/:id
async fn get_room(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<RoomSummary>, ApiError> {
    match state.directory.get_room(&id).await {
        Some(room) => Ok(Json(room.summary().await)),
        None => Err(ApiError::NotFound(format!("Room {id}"))),
    }
}

/// GET /api/stats
async fn get_stats(State(state): State<HttpState>) -> Json<ServerStats> {
    Json(state.stats.snapshot(state.directory.room_count().await))
}
