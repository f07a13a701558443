//! WebSocket API handler and connection management.
//!
//! One WebSocket per client session: binary frames are audio for the STT
//! backend, text frames are control commands, and everything the pipeline
//! produces flows back as tagged JSON events through the connection
//! registry.

use crate::session::run_session;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_voice::VoiceError;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Per-connection event buffer. Beyond this the client is too slow and
/// events are dropped.
const CONNECTION_BUFFER: usize = 256;

/// Events pushed to the client. Tagged JSON, snake_case types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Session accepted; audio may flow.
    Ready {
        session_id: String,
        message: String,
        timestamp: String,
    },
    /// Acknowledgement of a text control command.
    CommandResponse { message: String, status: String },
    /// Transcript text from the STT stream; `is_final` marks a complete,
    /// formatted turn.
    Transcript { text: String, is_final: bool },
    /// One generated text chunk, pushed before its audio.
    AiResponse { text: String },
    /// One synthesized audio fragment, base64-encoded.
    AudioChunk {
        audio: String,
        chunk_index: u64,
        chunk_size: usize,
        total_size: usize,
        is_final: bool,
    },
    /// Informational pipeline state change.
    Status { message: String },
    /// Periodic receipt acknowledgement for inbound audio frames.
    AudioAck { frames: u64, total_bytes: u64 },
    /// One utterance's reply pipeline finished normally.
    TurnComplete {
        text: String,
        audio_chunks: u64,
        total_audio_bytes: usize,
        timestamp: String,
    },
    /// A failure the client should hear about. The session stays usable
    /// unless the transport itself is gone.
    Error {
        kind: String,
        message: String,
        timestamp: String,
    },
}

impl ClientEvent {
    pub fn error(err: &VoiceError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            timestamp: now_iso(),
        }
    }
}

/// RFC 3339 timestamp for client-facing events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Tracks live client connections and supports best-effort push.
///
/// `push` to a connection whose channel is closed unregisters it, so a
/// disconnect race degrades to a no-op rather than an error anywhere in
/// the pipeline.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, mpsc::Sender<ClientEvent>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's event sender and returns its id.
    pub async fn register(&self, sender: mpsc::Sender<ClientEvent>) -> Uuid {
        let id = Uuid::new_v4();
        self.connections.write().await.insert(id, sender);
        id
    }

    /// Removes a connection. Unregistering twice is a no-op.
    pub async fn unregister(&self, id: Uuid) {
        self.connections.write().await.remove(&id);
    }

    pub async fn is_live(&self, id: Uuid) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Best-effort push. Unknown and dead connections are silently
    /// skipped; a dead connection is unregistered on the way out.
    pub async fn push(&self, id: Uuid, event: ClientEvent) {
        let delivery = {
            let connections = self.connections.read().await;
            match connections.get(&id) {
                Some(sender) => sender.try_send(event),
                None => return,
            }
        };

        match delivery {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    connection = %id,
                    event = ?event_kind(&event),
                    "dropping event for slow consumer"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection = %id, "push to dead connection, unregistering");
                self.unregister(id).await;
            }
        }
    }
}

fn event_kind(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::Ready { .. } => "ready",
        ClientEvent::CommandResponse { .. } => "command_response",
        ClientEvent::Transcript { .. } => "transcript",
        ClientEvent::AiResponse { .. } => "ai_response",
        ClientEvent::AudioChunk { .. } => "audio_chunk",
        ClientEvent::Status { .. } => "status",
        ClientEvent::AudioAck { .. } => "audio_ack",
        ClientEvent::TurnComplete { .. } => "turn_complete",
        ClientEvent::Error { .. } => "error",
    }
}

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Caller-chosen conversation id; a fresh one is generated when absent.
    pub session_id: Option<String>,
}

/// WebSocket handler: `GET /ws?session_id=...`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let session_id = params
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Handles one client connection for its lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ClientEvent>(CONNECTION_BUFFER);
    let conn_id = state.connections.register(tx).await;

    // Forward pipeline events to the socket until either side goes away.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(AxumMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("failed to serialize client event: {e}");
                }
            }
        }
    });

    let session = state.sessions.get_or_create(&session_id).await;
    session.attach(conn_id);

    // The STT stream is the session's input; without it the session
    // cannot run at all.
    let (stt, stt_events) = match parley_voice::stt::connect(&state.stt_config).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "stt connect failed");
            state.connections.push(conn_id, ClientEvent::error(&e)).await;
            state.connections.unregister(conn_id).await;
            session.detach();
            send_task.abort();
            return;
        }
    };

    tokio::spawn(run_session(
        state.clone(),
        session.clone(),
        conn_id,
        stt.clone(),
        stt_events,
    ));

    tracing::info!(session_id = %session_id, connection = %conn_id, "client connected");
    state
        .connections
        .push(
            conn_id,
            ClientEvent::Ready {
                session_id: session_id.clone(),
                message: "streaming session ready, send binary audio frames".to_string(),
                timestamp: now_iso(),
            },
        )
        .await;

    let mut frames = 0u64;
    let mut total_bytes = 0u64;

    while let Some(Ok(message)) = receiver.next().await {
        session.touch();
        match message {
            AxumMessage::Binary(frame) => {
                frames += 1;
                total_bytes += frame.len() as u64;
                if let Err(e) = stt.send_audio(frame.to_vec()).await {
                    tracing::warn!(session_id = %session_id, error = %e, "audio forward failed");
                    state.connections.push(conn_id, ClientEvent::error(&e)).await;
                    break;
                }
                let ack_every = state.settings.audio_ack_every;
                if ack_every > 0 && frames % ack_every == 0 {
                    state
                        .connections
                        .push(conn_id, ClientEvent::AudioAck { frames, total_bytes })
                        .await;
                }
            }
            AxumMessage::Text(command) => match command.as_str() {
                "start_streaming" => {
                    state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::CommandResponse {
                                message: "ready to receive audio frames".to_string(),
                                status: "streaming_ready".to_string(),
                            },
                        )
                        .await;
                }
                "stop_streaming" => {
                    state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::CommandResponse {
                                message: format!(
                                    "audio stream stopped after {frames} frames ({total_bytes} bytes)"
                                ),
                                status: "streaming_stopped".to_string(),
                            },
                        )
                        .await;
                    break;
                }
                other => {
                    tracing::warn!(session_id = %session_id, command = other, "unknown command");
                    state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::Error {
                                kind: "transport".to_string(),
                                message: format!("unknown command: {other}"),
                                timestamp: now_iso(),
                            },
                        )
                        .await;
                }
            },
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    tracing::info!(
        session_id = %session_id,
        connection = %conn_id,
        frames,
        total_bytes,
        "client disconnected"
    );

    // Disconnect: in-flight pushes become no-ops, audio stops flowing to
    // STT, and the synthesis connection is released. An in-flight pipeline
    // may hold the relay, so release from a task rather than blocking here.
    state.connections.unregister(conn_id).await;
    stt.terminate().await;
    session.detach();
    send_task.abort();
    let cleanup = session.clone();
    tokio::spawn(async move {
        cleanup.relay.lock().await.release();
    });
}
