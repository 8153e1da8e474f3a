#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::config::RelayConfig;
use crate::identity::auth::{AuthError, IdentityVerifier};
use crate::identity::Identity;
use crate::metrics::ServerMetrics;
use crate::relay::RelayEngine;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Slack on top of the upload limit for the JSON envelope around a payload.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    engine: Arc<RelayEngine>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    config: Arc<RelayConfig>,
}

/// Query string accepted on the WebSocket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub name: Option<String>,
}

impl SignalingServer {
    pub fn new(
        engine: Arc<RelayEngine>,
        verifier: Option<Arc<dyn IdentityVerifier>>,
        metrics: ServerMetrics,
        config: Arc<RelayConfig>,
    ) -> Self {
        if verifier.is_some() {
            info!("Token verification enabled");
        } else {
            info!("No token verifier configured, all connections are guests");
        }

        Self {
            engine,
            verifier,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
        }
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        self.engine.rooms()
    }

    /// Resolve who is connecting. A token must verify; no token means guest.
    pub fn resolve_identity(&self, params: &ConnectParams) -> Result<Identity, AuthError> {
        let identities = self.engine.identities();
        match params.token.as_deref() {
            Some(token) => {
                let verifier = self.verifier.as_ref().ok_or(AuthError::NotConfigured)?;
                Ok(identities.connect_verified(verifier.verify(token)?))
            }
            None => Ok(identities.connect_guest(params.name.as_deref())),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/rooms", get(crate::room::api::list_rooms))
            .route("/api/rooms/{room_id}", get(crate::room::api::room_status))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port and runs until
    /// `shutdown` resolves.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager().room_count();
    let participants = server.room_manager().total_participant_count();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
        "identitiesOnline": server.engine.identities().online_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format. Protected by the
/// optional metrics token (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.config.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.room_manager().room_count();
    let participants = server.room_manager().total_participant_count();
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    Query(params): Query<ConnectParams>,
) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let identity = match server.resolve_identity(&params) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected WebSocket upgrade: {:?}", e);
            return e.into_response();
        }
    };

    let engine = server.engine.clone();
    let on_failed = engine.clone();
    let failed_id = identity.id.clone();
    ws.max_message_size(server.config.max_upload_bytes.saturating_add(ENVELOPE_OVERHEAD))
        .on_failed_upgrade(move |error| {
            warn!("WebSocket upgrade failed: {}", error);
            on_failed.identities().disconnect(&failed_id);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, engine, identity, server.config, server.metrics, permit)
        })
}
