use axum::{Json, debug_handler, extract::{Path, State}, http::StatusCode};
use tower_sessions::Session;

use crate::{AppResult, AppState, client::{Hub, RoomSummary}, id::RoomId, session};

/// Invite links land here: any parseable id of a live room the caller may
/// see, otherwise 404 (or 403 for guests at a permanent room).
#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(hub): State<Hub>,
    session: Session,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomSummary>> {
    let room_id = RoomId::parse(&room_id)?;
    let identity = session::require_identity(&session).await?;
    let room = hub.connect(identity).room(room_id).await?;
    let last_message = hub.log.last(room_id).await?;
    Ok(Json(RoomSummary { room, last_message }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_room(
    State(hub): State<Hub>,
    session: Session,
    Path(room_id): Path<String>,
) -> AppResult<StatusCode> {
    let room_id = RoomId::parse(&room_id)?;
    let identity = session::require_identity(&session).await?;
    hub.connect(identity).delete_room(room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
