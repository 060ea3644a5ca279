use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, routing::get};
use emberchat::{
    AppState, auth,
    blob::{HttpBlobStore, MAX_UPLOAD_BYTES},
    client::Hub,
    clock::SystemClock,
    config::Config,
    db, index, rooms,
    sweeper::Sweeper,
};
use tower_http::cors::CorsLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("emberchat=info")),
        )
        .init();

    let config = Config::from_env();

    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(config.session_inactivity));

    let pool = db::connect(&config.database_url).await?;
    let blobs = Arc::new(HttpBlobStore::new(config.blob_endpoint.clone(), config.blob_token.clone()));
    let hub = Hub::new(pool, blobs, Arc::new(SystemClock), config.core.clone());

    Sweeper::new(hub.clone()).spawn(config.sweep_interval);

    let app = Router::new()
        .route("/rooms/mine", get(index::my_rooms))
        .merge(auth::router())
        .nest("/r", rooms::router())
        .with_state(AppState { hub })
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1))
        .layer(session_layer)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
