use axum::{Json, debug_handler, extract::State};
use tower_sessions::Session;

use crate::{AppResult, AppState, client::{Hub, MyRooms}, session};

/// Permanent rooms the caller owns and the ones they joined, newest first,
/// each with its latest message.
#[debug_handler(state = AppState)]
pub async fn my_rooms(
    State(hub): State<Hub>,
    session: Session,
) -> AppResult<Json<MyRooms>> {
    let identity = session::require_identity(&session).await?;
    Ok(Json(hub.connect(identity).my_rooms().await?))
}
