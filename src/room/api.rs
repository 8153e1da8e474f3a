#![forbid(unsafe_code)]

// Read-only HTTP views of the room registry

use crate::room::RoomSummary;
use crate::signaling::SignalingServer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// GET /api/rooms
pub async fn list_rooms(State(server): State<SignalingServer>) -> Json<Vec<RoomSummary>> {
    Json(server.room_manager().list_active().await)
}

/// GET /api/rooms/{room_id}
pub async fn room_status(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSummary>, Response> {
    server
        .room_manager()
        .room_status(&room_id)
        .await
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("Room {room_id} not found") })),
            )
                .into_response()
        })
}
