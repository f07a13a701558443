//! Speech-synthesis relay.
//!
//! Owns the bidirectional connection to the synthesis backend, multiplexes
//! phrase submissions onto it, and demultiplexes returned audio fragments
//! back to the calling session. The backend protocol: one `voice_config`
//! message per connection, then `{text, end}` submissions; responses are
//! audio-bearing (`{audio, final}`) or status messages, ordered FIFO per
//! connection.
//!
//! The relay is never shared across two in-flight utterances — the
//! session's pipeline lock guarantees that. The connection is reused
//! across utterances, but any error releases it so a half-open backend
//! connection can never leak.

use crate::batch::GenerationChunk;
use crate::config::SynthesisConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// In-flight phrase bound; the relay awaits each submission, so the
/// backend never sees more than this many queued phrases.
const PHRASE_BUFFER: usize = 8;

/// Response channel capacity; audio fragments are drained promptly by the
/// session's forwarding task.
const RESPONSE_BUFFER: usize = 64;

/// One unit of synthesized audio, transport-encoded (base64).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    pub audio: String,
    /// Monotonic index within one synthesis context, starting at 0.
    pub index: u64,
    /// Transport-encoded size of this fragment.
    pub size: usize,
    /// Cumulative transport-encoded size including this fragment.
    pub total_size: usize,
    /// Set on exactly one fragment per context, always the last.
    pub is_final: bool,
}

/// What the relay emits while synthesizing one utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Audio(AudioFragment),
    /// Backend status message, forwarded verbatim.
    Status(serde_json::Value),
}

/// One phrase on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhraseSubmission {
    pub text: String,
    /// True only on the last submission of an utterance.
    pub end: bool,
}

/// One parsed backend response.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisResponse {
    Audio { audio: String, is_final: bool },
    Status(serde_json::Value),
}

/// Totals for one completed synthesis context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SynthesisSummary {
    pub fragments: u64,
    pub total_bytes: usize,
}

/// A live backend connection: a submission sender and a response receiver,
/// with the transport pumping between them.
#[derive(Debug)]
pub struct SynthesisConnection {
    requests: mpsc::Sender<PhraseSubmission>,
    responses: mpsc::Receiver<Result<SynthesisResponse, VoiceError>>,
}

impl SynthesisConnection {
    /// Assembles a connection from raw channel halves, for tests and
    /// alternate transports.
    pub fn from_parts(
        requests: mpsc::Sender<PhraseSubmission>,
        responses: mpsc::Receiver<Result<SynthesisResponse, VoiceError>>,
    ) -> Self {
        Self { requests, responses }
    }

    fn into_parts(
        self,
    ) -> (
        mpsc::Sender<PhraseSubmission>,
        mpsc::Receiver<Result<SynthesisResponse, VoiceError>>,
    ) {
        (self.requests, self.responses)
    }
}

/// Opens synthesis connections. One implementation per transport.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn open(&self) -> Result<SynthesisConnection, VoiceError>;
}

/// WebSocket [`SynthesisBackend`].
#[derive(Debug, Clone)]
pub struct WsSynthesisBackend {
    config: SynthesisConfig,
}

impl WsSynthesisBackend {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SynthesisBackend for WsSynthesisBackend {
    async fn open(&self) -> Result<SynthesisConnection, VoiceError> {
        let url = format!(
            "{}?api-key={}&sample_rate={}&channel_type=MONO&format={}",
            self.config.endpoint,
            self.config.api_key,
            self.config.sample_rate,
            self.config.encoding.as_str(),
        );
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Transport(format!("synthesis connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        // One-time voice/style configuration, before any text.
        let voice_config = serde_json::json!({ "voice_config": self.config.voice });
        sink.send(Message::Text(voice_config.to_string().into()))
            .await
            .map_err(|e| VoiceError::Transport(format!("synthesis voice config failed: {e}")))?;

        let (requests_tx, mut requests_rx) = mpsc::channel::<PhraseSubmission>(PHRASE_BUFFER);
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);

        tokio::spawn(async move {
            while let Some(phrase) = requests_rx.recv().await {
                let json = match serde_json::to_string(&phrase) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("failed to serialize phrase submission: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    tracing::warn!("synthesis send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let forwarded = match message {
                    Ok(Message::Text(text)) => match parse_response(text.as_str()) {
                        Some(response) => responses_tx.send(Ok(response)).await,
                        None => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = responses_tx
                            .send(Err(VoiceError::Transport(format!(
                                "synthesis connection failed: {e}"
                            ))))
                            .await;
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
        });

        Ok(SynthesisConnection::from_parts(requests_tx, responses_rx))
    }
}

/// Parses one backend response message. Unparseable messages are logged
/// and skipped.
fn parse_response(text: &str) -> Option<SynthesisResponse> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("unparseable synthesis response: {e}");
            return None;
        }
    };
    match value.get("audio").and_then(|a| a.as_str()) {
        Some(audio) => Some(SynthesisResponse::Audio {
            audio: audio.to_string(),
            is_final: value.get("final").and_then(|f| f.as_bool()).unwrap_or(false),
        }),
        None => Some(SynthesisResponse::Status(value)),
    }
}

/// Per-session synthesis relay. See the module docs for the contract.
pub struct SynthesisRelay {
    backend: Arc<dyn SynthesisBackend>,
    connection: Option<SynthesisConnection>,
    last_used: Instant,
}

impl SynthesisRelay {
    pub fn new(backend: Arc<dyn SynthesisBackend>) -> Self {
        Self {
            backend,
            connection: None,
            last_used: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Time since the relay last synthesized.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Drops the backend connection. Releasing an unconnected relay is a
    /// no-op.
    pub fn release(&mut self) {
        if self.connection.take().is_some() {
            tracing::debug!("released synthesis connection");
        }
    }

    /// Synthesizes one utterance: drains `phrases`, emits audio fragments
    /// and status messages on `events`, and returns totals once the
    /// backend marks the context final.
    ///
    /// Errors are returned for the caller to report; the connection has
    /// already been released by then. A phrase stream with no text never
    /// touches the backend.
    pub async fn synthesize(
        &mut self,
        phrases: &mut mpsc::Receiver<GenerationChunk>,
        events: &mpsc::Sender<SynthesisEvent>,
    ) -> Result<SynthesisSummary, VoiceError> {
        self.last_used = Instant::now();

        // Pull until the first chunk with content; empty finals are pure
        // end markers and mean there is nothing to synthesize.
        let first = loop {
            match phrases.recv().await {
                Some(chunk) if !chunk.text.is_empty() => break chunk,
                Some(chunk) if chunk.is_final => return Ok(SynthesisSummary::default()),
                Some(_) => continue,
                None => return Ok(SynthesisSummary::default()),
            }
        };

        if self.connection.is_none() {
            self.connection = Some(self.backend.open().await?);
        }
        let connection = self
            .connection
            .take()
            .ok_or_else(|| VoiceError::Synthesis("synthesis connection unavailable".to_string()))?;
        let (submit, mut responses) = connection.into_parts();

        let mut sending = !first.is_final;
        let mut end_sent = first.is_final;
        let mut index = 0u64;
        let mut total = 0usize;

        let result = async {
            submit_phrase(&submit, first.text, first.is_final).await?;

            loop {
                tokio::select! {
                    maybe_chunk = phrases.recv(), if sending => match maybe_chunk {
                        Some(chunk) => {
                            if chunk.is_final {
                                sending = false;
                                end_sent = true;
                                submit_phrase(&submit, chunk.text, true).await?;
                            } else if !chunk.text.is_empty() {
                                submit_phrase(&submit, chunk.text, false).await?;
                            }
                        }
                        None => {
                            sending = false;
                            if !end_sent {
                                submit_phrase(&submit, String::new(), true).await?;
                                end_sent = true;
                            }
                        }
                    },
                    maybe_response = responses.recv() => match maybe_response {
                        Some(Ok(SynthesisResponse::Audio { audio, is_final })) => {
                            let size = audio.len();
                            total += size;
                            let fragment = AudioFragment {
                                audio,
                                index,
                                size,
                                total_size: total,
                                is_final,
                            };
                            index += 1;
                            if events.send(SynthesisEvent::Audio(fragment)).await.is_err() {
                                return Err(VoiceError::Transport(
                                    "synthesis consumer dropped".to_string(),
                                ));
                            }
                            if is_final {
                                return Ok(SynthesisSummary {
                                    fragments: index,
                                    total_bytes: total,
                                });
                            }
                        }
                        Some(Ok(SynthesisResponse::Status(status))) => {
                            let _ = events.send(SynthesisEvent::Status(status)).await;
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(VoiceError::Transport(
                                "synthesis connection closed mid-stream".to_string(),
                            ));
                        }
                    }
                }
            }
        }
        .await;

        self.last_used = Instant::now();
        match result {
            Ok(summary) => {
                // Keep the connection for the next utterance.
                self.connection = Some(SynthesisConnection::from_parts(submit, responses));
                Ok(summary)
            }
            Err(e) => {
                // Connection state is unknown after a failure; drop it so
                // nothing half-open survives.
                tracing::warn!(error = %e, "synthesis failed, releasing connection");
                Err(e)
            }
        }
    }
}

async fn submit_phrase(
    submit: &mpsc::Sender<PhraseSubmission>,
    text: String,
    end: bool,
) -> Result<(), VoiceError> {
    submit
        .send(PhraseSubmission { text, end })
        .await
        .map_err(|_| VoiceError::Transport("synthesis connection closed".to_string()))
}
