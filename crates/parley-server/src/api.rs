//! HTTP API handlers: chat history and backend status.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /agent/chat/{sessionId}/history` — the session's ordered message
/// log. Unknown sessions are empty conversations, not errors.
pub async fn get_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    match state.history.get(&session_id).await {
        Ok(messages) => Json(json!({
            "success": true,
            "session_id": session_id,
            "message_count": messages.len(),
            "messages": messages,
        })),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "history read failed");
            Json(json!({
                "success": false,
                "session_id": session_id,
                "message_count": 0,
                "messages": [],
            }))
        }
    }
}

/// `GET /api/backend` — per-collaborator readiness plus live counters.
pub async fn backend_status_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "services": {
            "stt": true,
            "generation": true,
            "synthesis": true,
        },
        "sessions": state.sessions.len().await,
        "connections": state.connections.len().await,
        "timestamp": crate::api_ws::now_iso(),
    }))
}
