use axum::{Json, debug_handler};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{AppResult, identity::Identity, session};

#[derive(Deserialize)]
pub struct GuestForm {
    name: String,
    photo_ref: Option<String>,
}

#[debug_handler]
pub async fn guest(
    session: Session,
    Json(GuestForm { name, photo_ref }): Json<GuestForm>,
) -> AppResult<Json<Identity>> {
    let identity = Identity::guest(&name, photo_ref)?;
    session::remember(&session, &identity).await?;
    info!(user_id = %identity.id, "guest signed in");
    Ok(Json(identity))
}
