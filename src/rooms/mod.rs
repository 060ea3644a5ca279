mod lifecycle;
mod new;
mod room;
mod store;
mod upload;

use axum::{Router, routing::{get, post}};

use crate::{AppState, client::ws};

pub use lifecycle::Lifecycle;
pub use store::{LeaveOutcome, Room, RoomStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/new", post(new::new_room))
        .route("/{room_id}", get(room::room).delete(room::delete_room))
        .route("/{room_id}/upload", post(upload::upload))
        .route("/{room_id}/ws", get(ws::room_ws))
}
