pub mod appresult;
pub mod auth;
pub mod blob;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod identity;
pub mod index;
pub mod messages;
pub mod presence;
pub mod rooms;
pub mod session;
pub mod sweeper;

use axum::extract::FromRef;

pub use appresult::{AppError, AppResult};
pub use error::{ChatError, ChatResult};

use client::Hub;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Hub,
}
