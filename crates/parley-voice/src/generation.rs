//! Text-generation backend collaborator.
//!
//! The backend accepts a prompt plus the ordered conversation history and
//! supports two call shapes: a streaming reply (newline-delimited JSON
//! fragments) and a single complete reply. The orchestration core only
//! sees the [`Generator`] trait.

use crate::config::GenerationConfig;
use crate::error::VoiceError;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parley_types::ConversationMessage;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Lazy sequence of generated text fragments for one reply.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, VoiceError>> + Send>>;

/// Text-generation backend contract.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Streams a reply as it is generated.
    async fn stream_reply(
        &self,
        prompt: &str,
        history: &[ConversationMessage],
    ) -> Result<FragmentStream, VoiceError>;

    /// Returns one complete reply. The default drains the streaming shape.
    async fn complete(
        &self,
        prompt: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VoiceError> {
        let mut fragments = self.stream_reply(prompt, history).await?;
        let mut reply = String::new();
        while let Some(fragment) = fragments.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }
}

/// One history entry in the request body.
#[derive(Serialize)]
struct HistoryEntry<'a> {
    role: &'static str,
    text: &'a str,
}

/// Request body for both call shapes.
#[derive(Serialize)]
struct ReplyRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    prompt: &'a str,
    history: Vec<HistoryEntry<'a>>,
    stream: bool,
}

/// One line of a streaming response, or the whole non-streaming response.
#[derive(Deserialize)]
struct ReplyFragment {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    done: bool,
}

/// HTTP implementation of [`Generator`].
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl HttpGenerator {
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request(&self, prompt: &str, history: &[ConversationMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = ReplyRequest {
            model: &self.config.model,
            system: self.config.system_prompt.as_deref(),
            prompt,
            history: history
                .iter()
                .map(|m| HistoryEntry {
                    role: m.role.label(),
                    text: &m.text,
                })
                .collect(),
            stream,
        };
        self.client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn stream_reply(
        &self,
        prompt: &str,
        history: &[ConversationMessage],
    ) -> Result<FragmentStream, VoiceError> {
        let response = self
            .request(prompt, history, true)
            .send()
            .await
            .map_err(|e| VoiceError::Transport(format!("generation request failed: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Generation(format!("generation backend rejected request: {e}")))?;

        let mut bytes = response.bytes_stream();
        let fragments = stream! {
            let mut buffer = Vec::new();
            loop {
                match bytes.next().await {
                    Some(Ok(piece)) => {
                        buffer.extend_from_slice(&piece);
                        // Emit every complete line; a partial line stays buffered.
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            match parse_fragment_line(&line) {
                                Ok(Some(text)) => yield Ok(text),
                                Ok(None) => {}
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(VoiceError::Generation(format!("generation stream failed: {e}")));
                        return;
                    }
                    None => break,
                }
            }
            if !buffer.is_empty() {
                match parse_fragment_line(&buffer) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(fragments))
    }

    async fn complete(
        &self,
        prompt: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VoiceError> {
        let response = self
            .request(prompt, history, false)
            .send()
            .await
            .map_err(|e| VoiceError::Transport(format!("generation request failed: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Generation(format!("generation backend rejected request: {e}")))?;

        let fragment: ReplyFragment = response
            .json()
            .await
            .map_err(|e| VoiceError::Generation(format!("malformed generation response: {e}")))?;
        Ok(fragment.text.unwrap_or_default())
    }
}

/// Parses one NDJSON line into its text payload. Blank lines and bare
/// `{"done": true}` markers yield `None`.
fn parse_fragment_line(line: &[u8]) -> Result<Option<String>, VoiceError> {
    let trimmed = std::str::from_utf8(line)
        .map_err(|e| VoiceError::Generation(format!("non-utf8 generation fragment: {e}")))?
        .trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let fragment: ReplyFragment = serde_json::from_str(trimmed)
        .map_err(|e| VoiceError::Generation(format!("malformed generation fragment: {e}")))?;
    if fragment.done {
        return Ok(fragment.text.filter(|t| !t.is_empty()));
    }
    Ok(fragment.text)
}
