//! Streaming speech-to-text collaborator.
//!
//! The backend takes a sample rate at connect time, then binary audio
//! frames, and reports begin/turn/termination/error events. Turn events
//! carry the transcript plus end-of-turn and formatted flags; the turn
//! buffer decides what becomes an utterance.
//!
//! The consumer never registers callbacks: [`connect`] returns a command
//! handle and a plain `mpsc::Receiver` of events, so the socket task and
//! the pipeline task only ever communicate through channel sends.

use crate::config::SttConfig;
use crate::error::VoiceError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Capacity of the event and command channels. Turn events are small and
/// infrequent; audio frames are paced by the client.
const CHANNEL_CAPACITY: usize = 256;

/// A provisional speech segment reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEvent {
    pub transcript: String,
    pub end_of_turn: bool,
    pub turn_is_formatted: bool,
}

/// Events produced by the STT backend for one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// The backend opened the stream.
    Begin { stream_id: String },
    Turn(TurnEvent),
    /// The backend closed the stream normally.
    Termination { audio_duration_secs: Option<f64> },
    /// Backend-reported error. The stream is unusable afterwards.
    Error(String),
}

/// Commands accepted by the stream's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttCommand {
    /// One binary audio frame.
    Audio(Vec<u8>),
    /// Ask the backend to emit formatted turns.
    Configure { format_turns: bool },
    /// Close the stream gracefully.
    Terminate,
}

/// Incoming wire messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Begin {
        id: String,
    },
    Turn {
        transcript: String,
        end_of_turn: bool,
        turn_is_formatted: bool,
    },
    Termination {
        #[serde(default)]
        audio_duration_seconds: Option<f64>,
    },
    Error {
        message: String,
    },
}

impl From<WireEvent> for SttEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Begin { id } => SttEvent::Begin { stream_id: id },
            WireEvent::Turn {
                transcript,
                end_of_turn,
                turn_is_formatted,
            } => SttEvent::Turn(TurnEvent {
                transcript,
                end_of_turn,
                turn_is_formatted,
            }),
            WireEvent::Termination {
                audio_duration_seconds,
            } => SttEvent::Termination {
                audio_duration_secs: audio_duration_seconds,
            },
            WireEvent::Error { message } => SttEvent::Error(message),
        }
    }
}

/// Outgoing wire control messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireControl {
    Configure { format_turns: bool },
    Terminate,
}

/// Command handle for one STT stream. Cloneable: the socket task forwards
/// audio while the pipeline task requests formatting, both through the
/// same writer.
#[derive(Debug, Clone)]
pub struct SttStream {
    commands: mpsc::Sender<SttCommand>,
}

impl SttStream {
    /// Builds a handle backed by a raw command channel, for tests and
    /// alternate transports. [`connect`] uses this internally.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SttCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { commands: tx }, rx)
    }

    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<(), VoiceError> {
        self.commands
            .send(SttCommand::Audio(frame))
            .await
            .map_err(|_| VoiceError::Transport("stt stream is closed".to_string()))
    }

    pub async fn request_formatting(&self) -> Result<(), VoiceError> {
        self.commands
            .send(SttCommand::Configure { format_turns: true })
            .await
            .map_err(|_| VoiceError::Transport("stt stream is closed".to_string()))
    }

    /// Closes the stream. Terminating an already-closed stream is a no-op.
    pub async fn terminate(&self) {
        let _ = self.commands.send(SttCommand::Terminate).await;
    }
}

/// Opens a streaming transcription session.
///
/// Returns the command handle and the event receiver. The receiver yields
/// `None` once the backend connection is gone, which the session treats as
/// fatal.
pub async fn connect(config: &SttConfig) -> Result<(SttStream, mpsc::Receiver<SttEvent>), VoiceError> {
    let url = format!("{}?sample_rate={}", config.endpoint, config.sample_rate);
    let mut request = url
        .into_client_request()
        .map_err(|e| VoiceError::Config(format!("invalid stt endpoint: {e}")))?;
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&config.api_key)
            .map_err(|e| VoiceError::Config(format!("invalid stt api key: {e}")))?,
    );

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| VoiceError::Transport(format!("stt connect failed: {e}")))?;
    let (mut sink, mut stream) = socket.split();

    let (handle, mut commands) = SttStream::channel(CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);

    // Writer: drains commands onto the socket until terminated or the
    // handle is dropped.
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match command {
                SttCommand::Audio(frame) => sink.send(Message::Binary(frame.into())).await,
                SttCommand::Configure { format_turns } => {
                    match serde_json::to_string(&WireControl::Configure { format_turns }) {
                        Ok(json) => sink.send(Message::Text(json.into())).await,
                        Err(e) => {
                            tracing::error!("failed to serialize stt configure message: {e}");
                            continue;
                        }
                    }
                }
                SttCommand::Terminate => {
                    if let Ok(json) = serde_json::to_string(&WireControl::Terminate) {
                        let _ = sink.send(Message::Text(json.into())).await;
                    }
                    break;
                }
            };
            if let Err(e) = result {
                tracing::warn!("stt send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: forwards backend events until the connection or the
    // consumer goes away.
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<WireEvent>(text.as_str()) {
                    Ok(wire) => {
                        if events_tx.send(wire.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("unparseable stt event: {e}");
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    let _ = events_tx
                        .send(SttEvent::Error(format!("stt connection failed: {e}")))
                        .await;
                    break;
                }
            }
        }
    });

    Ok((handle, events_rx))
}
