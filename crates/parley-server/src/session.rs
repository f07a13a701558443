//! Session registry and the per-session pipeline coordinator.
//!
//! A session is one logical conversation: its turn buffer, its pipeline
//! lock, its synthesis relay, and (at most) one live client connection.
//! Sessions are owned records in an explicit registry, created on demand
//! and discarded by the idle sweeper — no ambient global maps.
//!
//! Concurrency shape: the socket task forwards audio while the coordinator
//! task consumes STT events; an accepted utterance runs the reply pipeline
//! under the session's lock. The lock covers only generation + synthesis,
//! never raw audio forwarding, so speech keeps flowing to STT while a
//! previous reply is still being spoken.

use crate::api_ws::{now_iso, ClientEvent};
use crate::AppState;
use futures_util::StreamExt;
use parley_types::Role;
use parley_voice::batch::chunk_stream;
use parley_voice::stt::{SttEvent, SttStream};
use parley_voice::synthesis::{SynthesisBackend, SynthesisEvent, SynthesisRelay};
use parley_voice::turn::{TurnBuffer, TurnDecision, Utterance};
use parley_voice::VoiceError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// Phrase hand-off depth between the batcher and the relay.
const PHRASE_QUEUE: usize = 8;

/// Synthesis event hand-off depth between the relay and the event
/// forwarder.
const SYNTHESIS_QUEUE: usize = 64;

/// One logical conversation's owned state.
pub struct Session {
    pub id: String,
    /// Serializes the generation+synthesis pipeline: at most one in-flight
    /// utterance per session.
    pipeline_lock: Arc<Mutex<()>>,
    /// The session's synthesis relay; never shared across two in-flight
    /// utterances (the pipeline lock guarantees a single holder).
    pub relay: Mutex<SynthesisRelay>,
    conn_id: std::sync::Mutex<Option<Uuid>>,
    last_active: std::sync::Mutex<Instant>,
}

impl Session {
    fn new(id: String, backend: Arc<dyn SynthesisBackend>) -> Self {
        Self {
            id,
            pipeline_lock: Arc::new(Mutex::new(())),
            relay: Mutex::new(SynthesisRelay::new(backend)),
            conn_id: std::sync::Mutex::new(None),
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Binds the session to a live client connection.
    pub fn attach(&self, conn: Uuid) {
        if let Ok(mut slot) = self.conn_id.lock() {
            *slot = Some(conn);
        }
        self.touch();
    }

    /// Unbinds the connection on disconnect.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.conn_id.lock() {
            *slot = None;
        }
        self.touch();
    }

    pub fn is_connected(&self) -> bool {
        self.conn_id.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn touch(&self) {
        if let Ok(mut at) = self.last_active.lock() {
            *at = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Tries to claim the pipeline. `None` while another utterance's
    /// reply is still in flight.
    pub fn try_begin_pipeline(&self) -> Option<OwnedMutexGuard<()>> {
        self.pipeline_lock.clone().try_lock_owned().ok()
    }
}

/// Mapping from session identifier to its owned record.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    synthesis: Arc<dyn SynthesisBackend>,
}

impl SessionRegistry {
    pub fn new(synthesis: Arc<dyn SynthesisBackend>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            synthesis,
        }
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return session.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id = id, "created session");
                Arc::new(Session::new(id.to_string(), self.synthesis.clone()))
            })
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Consumes STT events for one session until the stream ends.
///
/// Turn events feed the turn buffer; an accepted utterance claims the
/// pipeline lock and spawns the reply pipeline, or is dropped when a reply
/// is already in flight. Loss of the STT stream is fatal to the session's
/// input — the loop ends and only the client socket teardown remains.
pub async fn run_session(
    state: Arc<AppState>,
    session: Arc<Session>,
    conn_id: Uuid,
    stt: SttStream,
    mut events: mpsc::Receiver<SttEvent>,
) {
    let mut turns = TurnBuffer::new(state.settings.cooldown);

    while let Some(event) = events.recv().await {
        match event {
            SttEvent::Begin { stream_id } => {
                tracing::debug!(session_id = %session.id, stream_id, "transcription stream began");
            }
            SttEvent::Turn(turn) => {
                session.touch();
                if !turn.transcript.is_empty() {
                    state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::Transcript {
                                text: turn.transcript.clone(),
                                is_final: turn.end_of_turn && turn.turn_is_formatted,
                            },
                        )
                        .await;
                }
                match turns.accept(&turn.transcript, turn.end_of_turn, turn.turn_is_formatted) {
                    TurnDecision::Accepted(utterance) => match session.try_begin_pipeline() {
                        Some(permit) => {
                            tokio::spawn(run_pipeline(
                                state.clone(),
                                session.clone(),
                                conn_id,
                                utterance,
                                permit,
                            ));
                        }
                        None => {
                            tracing::info!(
                                session_id = %session.id,
                                seq = utterance.seq,
                                "dropping utterance, reply already in flight"
                            );
                            state
                                .connections
                                .push(
                                    conn_id,
                                    ClientEvent::Status {
                                        message: "still speaking, utterance dropped".to_string(),
                                    },
                                )
                                .await;
                        }
                    },
                    TurnDecision::RequestFormatting => {
                        if let Err(e) = stt.request_formatting().await {
                            tracing::warn!(session_id = %session.id, error = %e, "formatting request failed");
                        }
                    }
                    TurnDecision::Dropped => {}
                }
            }
            SttEvent::Termination { audio_duration_secs } => {
                tracing::info!(
                    session_id = %session.id,
                    audio_duration_secs,
                    "transcription stream terminated"
                );
                state
                    .connections
                    .push(
                        conn_id,
                        ClientEvent::Status {
                            message: "transcription stream ended".to_string(),
                        },
                    )
                    .await;
                break;
            }
            SttEvent::Error(message) => {
                tracing::error!(session_id = %session.id, reason = %message, "transcription stream failed");
                state
                    .connections
                    .push(
                        conn_id,
                        ClientEvent::error(&VoiceError::Transcription(message)),
                    )
                    .await;
                break;
            }
        }
    }
}

/// Runs one utterance's reply pipeline under the session lock.
///
/// History gets the user message up front and the assistant text exactly
/// once at the end: the accumulated reply on success or after a synthesis
/// failure, the fixed fallback phrase when generation failed before
/// producing anything.
async fn run_pipeline(
    state: Arc<AppState>,
    session: Arc<Session>,
    conn_id: Uuid,
    utterance: Utterance,
    _permit: OwnedMutexGuard<()>,
) {
    let session_id = session.id.clone();
    tracing::info!(session_id = %session_id, seq = utterance.seq, "pipeline started");

    // Read-before-append: the prompt context excludes the new user turn.
    let history = match state.history.get(&session_id).await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "history read failed");
            Vec::new()
        }
    };
    if let Err(e) = state
        .history
        .append(&session_id, Role::User, &utterance.text)
        .await
    {
        tracing::error!(session_id = %session_id, error = %e, "history append(user) failed");
    }

    state
        .connections
        .push(
            conn_id,
            ClientEvent::Status {
                message: "generating reply".to_string(),
            },
        )
        .await;

    let fragments = match state.generator.stream_reply(&utterance.text, &history).await {
        Ok(fragments) => fragments,
        Err(e) => {
            // Generation never started; substitute the fixed fallback so
            // history stays role-consistent.
            tracing::error!(session_id = %session_id, error = %e, "generation failed to start");
            let fallback = e.fallback_phrase().to_string();
            if let Err(e) = state
                .history
                .append(&session_id, Role::Assistant, &fallback)
                .await
            {
                tracing::error!(session_id = %session_id, error = %e, "history append(assistant) failed");
            }
            state.connections.push(conn_id, ClientEvent::error(&e)).await;
            state
                .connections
                .push(conn_id, ClientEvent::AiResponse { text: fallback })
                .await;
            return;
        }
    };

    // A mid-stream generation error ends the fragment stream; the batcher
    // still flushes what arrived, and the error is reported afterwards.
    let generation_error: Arc<std::sync::Mutex<Option<VoiceError>>> =
        Arc::new(std::sync::Mutex::new(None));
    let error_slot = generation_error.clone();
    let text_stream = fragments.scan((), move |_, item| {
        std::future::ready(match item {
            Ok(text) => Some(text),
            Err(e) => {
                if let Ok(mut slot) = error_slot.lock() {
                    *slot = Some(e);
                }
                None
            }
        })
    });
    let chunks = chunk_stream(state.settings.batch, text_stream);

    let (phrase_tx, mut phrase_rx) = mpsc::channel(PHRASE_QUEUE);
    let (synth_tx, mut synth_rx) = mpsc::channel(SYNTHESIS_QUEUE);

    let relay_session = session.clone();
    let relay_task = tokio::spawn(async move {
        let mut relay = relay_session.relay.lock().await;
        relay.synthesize(&mut phrase_rx, &synth_tx).await
    });

    let forward_state = state.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = synth_rx.recv().await {
            match event {
                SynthesisEvent::Audio(fragment) => {
                    forward_state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::AudioChunk {
                                audio: fragment.audio,
                                chunk_index: fragment.index,
                                chunk_size: fragment.size,
                                total_size: fragment.total_size,
                                is_final: fragment.is_final,
                            },
                        )
                        .await;
                }
                SynthesisEvent::Status(status) => {
                    forward_state
                        .connections
                        .push(
                            conn_id,
                            ClientEvent::Status {
                                message: status.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    });

    // Drive the batcher: each chunk's text goes to the client before the
    // chunk goes to synthesis, so text events always precede the audio
    // derived from them.
    let mut reply = String::new();
    tokio::pin!(chunks);
    while let Some(chunk) = chunks.next().await {
        if !chunk.text.is_empty() {
            reply.push_str(&chunk.text);
            state
                .connections
                .push(
                    conn_id,
                    ClientEvent::AiResponse {
                        text: chunk.text.clone(),
                    },
                )
                .await;
        }
        if phrase_tx.send(chunk).await.is_err() {
            // Relay already bailed out; keep draining generation so the
            // full reply still reaches history.
            tracing::debug!(session_id = %session_id, "relay gone, text-only from here");
        }
    }
    drop(phrase_tx);

    let synthesis_result = match relay_task.await {
        Ok(result) => result,
        Err(e) => Err(VoiceError::Synthesis(format!("synthesis task failed: {e}"))),
    };
    if let Err(e) = forwarder.await {
        tracing::error!(session_id = %session_id, error = %e, "audio forwarder failed");
    }

    let generation_error = generation_error.lock().ok().and_then(|mut slot| slot.take());

    if let Some(e) = generation_error {
        tracing::error!(session_id = %session_id, error = %e, "generation failed mid-stream");
        let fell_back = reply.is_empty();
        let text = if fell_back {
            e.fallback_phrase().to_string()
        } else {
            reply
        };
        if let Err(e) = state.history.append(&session_id, Role::Assistant, &text).await {
            tracing::error!(session_id = %session_id, error = %e, "history append(assistant) failed");
        }
        state.connections.push(conn_id, ClientEvent::error(&e)).await;
        if fell_back {
            state
                .connections
                .push(conn_id, ClientEvent::AiResponse { text })
                .await;
        }
        return;
    }

    if reply.is_empty() {
        tracing::warn!(session_id = %session_id, "generation produced no text");
        state
            .connections
            .push(
                conn_id,
                ClientEvent::Status {
                    message: "no reply generated".to_string(),
                },
            )
            .await;
        return;
    }

    // The text reply is recorded even when synthesis failed: the client
    // saw the text chunks, only the audio is missing.
    if let Err(e) = state.history.append(&session_id, Role::Assistant, &reply).await {
        tracing::error!(session_id = %session_id, error = %e, "history append(assistant) failed");
    }

    match synthesis_result {
        Ok(summary) => {
            tracing::info!(
                session_id = %session_id,
                seq = utterance.seq,
                audio_chunks = summary.fragments,
                total_audio_bytes = summary.total_bytes,
                "pipeline completed"
            );
            state
                .connections
                .push(
                    conn_id,
                    ClientEvent::TurnComplete {
                        text: reply,
                        audio_chunks: summary.fragments,
                        total_audio_bytes: summary.total_bytes,
                        timestamp: now_iso(),
                    },
                )
                .await;
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "synthesis failed");
            state.connections.push(conn_id, ClientEvent::error(&e)).await;
        }
    }
}
