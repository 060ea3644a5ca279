use axum::{Json, debug_handler, extract::State, http::StatusCode};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{AppResult, AppState, client::Hub, session};

use super::Room;

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomForm {
    name: String,
    #[serde(default = "temporary_by_default")]
    is_temporary: bool,
}

fn temporary_by_default() -> bool {
    true
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(hub): State<Hub>,
    session: Session,

    Json(NewRoomForm { name, is_temporary }): Json<NewRoomForm>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let identity = session::require_identity(&session).await?;
    let room = hub.connect(identity).create_room(&name, is_temporary).await?;
    Ok((StatusCode::CREATED, Json(room)))
}
