#![forbid(unsafe_code)]

// Screenrelay server binary

use anyhow::Result;
use screenrelay::config::RelayConfig;
use screenrelay::identity::auth::{IdentityVerifier, JwtVerifier};
use screenrelay::identity::IdentityDirectory;
use screenrelay::metrics::ServerMetrics;
use screenrelay::relay::RelayEngine;
use screenrelay::room::RoomManager;
use screenrelay::signaling::SignalingServer;
use screenrelay::storage::DiscardingFileStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screenrelay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Screenrelay - Starting server");

    let config = Arc::new(RelayConfig::from_env());
    config.log_summary();

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(config.rooms.clone(), metrics.clone()));
    let identities = Arc::new(IdentityDirectory::new(config.identity_grace));
    let engine = Arc::new(RelayEngine::new(
        room_manager.clone(),
        identities,
        Arc::new(DiscardingFileStore),
        metrics.clone(),
        config.max_upload_bytes,
    ));

    let verifier = config
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn IdentityVerifier>);

    let sweeper = engine.spawn_sweeper(config.sweep_interval);

    // Create and start signaling server
    let signaling_server = SignalingServer::new(engine, verifier, metrics, config.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let result = signaling_server.serve(config.port, shutdown).await;

    sweeper.abort();
    room_manager.shutdown().await;

    if let Err(e) = &result {
        tracing::error!("Signaling server error: {}", e);
    }
    info!("Server shutdown complete");
    result
}
