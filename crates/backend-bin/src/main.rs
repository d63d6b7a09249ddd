// ============================
// crates/backend-bin/src/main.rs
// ============================
//! Roomhub server binary.
use backend_lib::{config::Settings, storage::FlatFileStorage, ws_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    info!("Starting roomhub server...");

    let settings = Settings::load().unwrap_or_else(|err| {
        warn!(%err, "no configuration found, using defaults");
        Settings::default()
    });
    debug!("Configuration loaded: {:?}", settings);

    std::fs::create_dir_all(&settings.storage.path)?;
    let storage = FlatFileStorage::new(&settings.storage.path)?;
    info!("Storage initialized with path: {}", settings.storage.path.display());

    let addr: SocketAddr =
        format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let state = Arc::new(AppState::new(storage, settings));
    info!("Application state initialized");

    let app = ws_router::create_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
