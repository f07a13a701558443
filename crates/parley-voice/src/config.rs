//! Connection settings for the three streaming backends.
//!
//! API keys never appear in `Debug` output; every config type redacts them.

use crate::error::VoiceError;
use parley_types::voice::{AudioEncoding, VoiceConfig};
use serde::Deserialize;
use std::fmt;

fn default_sample_rate() -> u32 {
    16_000
}

fn default_synthesis_sample_rate() -> u32 {
    44_100
}

/// Streaming speech-to-text backend settings.
#[derive(Clone, Deserialize)]
pub struct SttConfig {
    /// WebSocket endpoint, e.g. `wss://stt.example.com/v3/stream`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Sample rate of the client audio forwarded to the backend.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl SttConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.endpoint.is_empty() {
            return Err(VoiceError::Config("stt.endpoint is not set".to_string()));
        }
        if self.api_key.is_empty() {
            return Err(VoiceError::Config("stt.api_key is not set".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for SttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_model() -> String {
    "parley-chat-1".to_string()
}

/// Text-generation backend settings.
#[derive(Clone, Deserialize)]
pub struct GenerationConfig {
    /// HTTP endpoint accepting prompt + history, e.g.
    /// `https://generate.example.com/v1/replies`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional system instructions prepended by the backend.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.endpoint.is_empty() {
            return Err(VoiceError::Config(
                "generation.endpoint is not set".to_string(),
            ));
        }
        if self.api_key.is_empty() {
            return Err(VoiceError::Config(
                "generation.api_key is not set".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .finish()
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: default_model(),
            system_prompt: None,
        }
    }
}

/// Speech-synthesis backend settings.
#[derive(Clone, Deserialize)]
pub struct SynthesisConfig {
    /// WebSocket endpoint, e.g. `wss://speech.example.com/v1/stream-input`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Voice and style sent once per connection.
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default = "default_synthesis_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub encoding: AudioEncoding,
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.endpoint.is_empty() {
            return Err(VoiceError::Config(
                "synthesis.endpoint is not set".to_string(),
            ));
        }
        if self.api_key.is_empty() {
            return Err(VoiceError::Config(
                "synthesis.api_key is not set".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SynthesisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("voice", &self.voice)
            .field("sample_rate", &self.sample_rate)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            voice: VoiceConfig::default(),
            sample_rate: default_synthesis_sample_rate(),
            encoding: AudioEncoding::default(),
        }
    }
}
