//! # tandem-server
//!
//! Real-time pairing relay for collaborative template editing.
//!
//! This binary provides:
//! - **WebSocket relay** that pairs requesters with helpers, broadcasts the
//!   open assistance list, and forwards chat, file switches and chunked
//!   template content between peers
//! - **File store** for js/css/html artifacts with one-shot downloads and
//!   chunked uploads
//! - **REST API** (axum) for health checks, instance info and file transfer

mod api;
mod assistance;
mod config;
mod coordinator;
mod error;
mod file_store;
mod identity;
mod message_log;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::file_store::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem_server=debug")),
        )
        .init();

    info!(
        "Starting {} relay server v{}",
        tandem_shared::constants::APP_NAME,
        env!("CARGO_PKG_VERSION")
    );

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // File store (creates directory if missing)
    let file_store = Arc::new(
        FileStore::new(config.file_storage_path.clone(), config.max_file_size).await?,
    );

    // Session coordinator owns every registry; sockets talk to it by handle
    let coordinator = coordinator::spawn_coordinator(config.coordinator());

    let app_state = AppState {
        file_store,
        coordinator,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic purge of stale uploads
    let store = app_state.file_store.clone();
    let max_age = config.file_max_age;
    let every = config.file_cleanup_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.cleanup_older_than(max_age).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
