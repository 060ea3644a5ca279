use axum::{Json, body::Bytes, debug_handler, extract::{Path, Query, State}};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{AppResult, AppState, client::Hub, id::{MessageId, RoomId}, messages::Message, session};

#[derive(Debug, Deserialize)]
pub(crate) struct UploadQuery {
    name: String,
    reply_to: Option<MessageId>,
    #[serde(default)]
    destructive: bool,
}

#[debug_handler(state = AppState)]
pub(crate) async fn upload(
    State(hub): State<Hub>,
    session: Session,
    Path(room_id): Path<String>,
    Query(UploadQuery { name, reply_to, destructive }): Query<UploadQuery>,

    body: Bytes,
) -> AppResult<Json<Message>> {
    let room_id = RoomId::parse(&room_id)?;
    let identity = session::require_identity(&session).await?;
    let message = hub
        .connect(identity)
        .upload(room_id, &name, body.to_vec(), reply_to, destructive)
        .await?;
    Ok(Json(message))
}
