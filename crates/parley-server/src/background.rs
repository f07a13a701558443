//! Background tasks for the parley server.
//!
//! One sweeper: releases synthesis connections that sat idle past their
//! window, and discards sessions whose client has been gone long enough
//! that the conversation is over.

use crate::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Runs the session sweeper indefinitely.
pub async fn start_session_sweeper(state: Arc<AppState>) {
    let interval = state.settings.sweep_interval.max(Duration::from_secs(1));
    tracing::info!(
        interval_secs = interval.as_secs(),
        "starting session sweeper"
    );

    loop {
        sleep(interval).await;
        sweep_once(&state).await;
    }
}

/// One sweep pass. Separated out so tests can drive it directly.
pub async fn sweep_once(state: &Arc<AppState>) {
    for session in state.sessions.snapshot().await {
        if session.is_connected() {
            // A pipeline holding the relay is not idle; skip it.
            if let Ok(mut relay) = session.relay.try_lock() {
                if relay.is_connected() && relay.idle_for() >= state.settings.synthesis_idle {
                    tracing::info!(session_id = %session.id, "releasing idle synthesis connection");
                    relay.release();
                }
            }
        } else if session.idle_for() >= state.settings.idle_timeout {
            tracing::info!(session_id = %session.id, "discarding idle session");
            state.sessions.remove(&session.id).await;
            if let Ok(mut relay) = session.relay.try_lock() {
                relay.release();
            }
            if let Err(e) = state.history.clear(&session.id).await {
                tracing::warn!(session_id = %session.id, error = %e, "history clear failed");
            }
        }
    }
}
