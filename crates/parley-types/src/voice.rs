//! Voice configuration for the synthesis backend.
//!
//! A `VoiceConfig` is sent once per synthesis connection, before any text
//! submissions, and selects the voice, speaking style, and delivery
//! parameters for everything synthesized on that connection.

use serde::{Deserialize, Serialize};

/// Audio container/encoding requested from the synthesis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    /// WAV-framed PCM.
    #[default]
    Wav,
    /// Raw little-endian PCM, no container.
    Pcm,
    /// MP3-compressed audio.
    Mp3,
}

impl AudioEncoding {
    /// Returns the wire label used in the synthesis connection URL.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wav => "WAV",
            Self::Pcm => "PCM",
            Self::Mp3 => "MP3",
        }
    }
}

/// Voice selection and style, sent as the one-time configuration message on
/// a synthesis connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Backend voice identifier (e.g. `"en-US-amara"`).
    #[serde(rename = "voiceId")]
    pub voice_id: String,
    /// Speaking style name.
    #[serde(default = "default_style")]
    pub style: String,
    /// Speech rate adjustment, 0 is the voice's natural rate.
    #[serde(default)]
    pub rate: i32,
    /// Pitch adjustment, 0 is the voice's natural pitch.
    #[serde(default)]
    pub pitch: i32,
    /// Prosody variation level.
    #[serde(default = "default_variation")]
    pub variation: u32,
}

fn default_style() -> String {
    "Conversational".to_string()
}

fn default_variation() -> u32 {
    1
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: "en-US-amara".to_string(),
            style: default_style(),
            rate: 0,
            pitch: 0,
            variation: default_variation(),
        }
    }
}
