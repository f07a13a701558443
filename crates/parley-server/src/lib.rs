//! Parley server library logic.

pub mod api;
pub mod api_ws;
pub mod background;
pub mod config;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use parley_history::HistoryStore;
use parley_voice::{BatchPolicy, Generator, SttConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Pipeline tuning shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Minimum interval between accepted utterances.
    pub cooldown: Duration,
    /// Phrase batching thresholds.
    pub batch: BatchPolicy,
    /// Acknowledge every Nth inbound audio frame (0 disables).
    pub audio_ack_every: u64,
    /// Release a synthesis connection after this idle period.
    pub synthesis_idle: Duration,
    /// Discard a disconnected session after this idle period.
    pub idle_timeout: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
}

impl From<&config::SessionConfig> for SessionSettings {
    fn from(config: &config::SessionConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            batch: config.batch_policy(),
            audio_ack_every: config.audio_ack_every,
            synthesis_idle: Duration::from_secs(config.synthesis_idle_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live client connections.
    pub connections: api_ws::ConnectionRegistry,
    /// Session records, one per conversation.
    pub sessions: session::SessionRegistry,
    /// Conversation history collaborator.
    pub history: Arc<dyn HistoryStore>,
    /// Text-generation collaborator.
    pub generator: Arc<dyn Generator>,
    /// STT backend connection settings, used per client connection.
    pub stt_config: SttConfig,
    /// Pipeline tuning.
    pub settings: SessionSettings,
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/backend", get(api::backend_status_handler))
        .route(
            "/agent/chat/{sessionId}/history",
            get(api::get_history_handler),
        )
        .route("/ws", get(api_ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
