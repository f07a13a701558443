//! Parley server binary — real-time voice conversation over WebSockets.
//!
//! Starts an axum server with structured logging, validated backend
//! configuration, and graceful shutdown on SIGTERM/SIGINT.

use parley_history::MemoryHistory;
use parley_server::{app, background, config, session::SessionRegistry, AppState, SessionSettings};
use parley_voice::{HttpGenerator, WsSynthesisBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Missing credentials are fatal here, never per-request.
    config
        .validate()
        .expect("backend configuration incomplete — set stt/generation/synthesis endpoints and api keys");

    let history = Arc::new(MemoryHistory::new());
    let generator = Arc::new(HttpGenerator::new(config.generation.clone()));
    let synthesis = Arc::new(WsSynthesisBackend::new(config.synthesis.clone()));

    let state = AppState {
        connections: parley_server::api_ws::ConnectionRegistry::new(),
        sessions: SessionRegistry::new(synthesis),
        history,
        generator,
        stt_config: config.stt.clone(),
        settings: SessionSettings::from(&config.session),
    };

    // Background sweeper: idle synthesis connections and dead sessions.
    let sweeper_state = Arc::new(state.clone());
    tokio::spawn(background::start_session_sweeper(sweeper_state));

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting parley server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("parley server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
