mod guest;
mod logout;

use axum::{Router, routing::post};

use crate::AppState;

pub use guest::guest;
pub use logout::logout;

/// Guest sign-in only. Full accounts come from an external provider that
/// writes the same session keys.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/guest", post(guest))
        .route("/logout", post(logout))
}
