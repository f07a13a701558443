use thiserror::Error;

/// Errors from the streaming voice collaborators.
///
/// Only `Config` is fatal, and only at process start. `Transcription`,
/// `Generation`, and `Synthesis` are recoverable per utterance: the session
/// reports them to the client and stays usable. `Transport` covers lost
/// connections; losing the client or STT connection ends the session, losing
/// a generation or synthesis connection ends only the current utterance.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl VoiceError {
    /// Short stable label for client-facing error events and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transcription(_) => "transcription",
            Self::Generation(_) => "generation",
            Self::Synthesis(_) => "synthesis",
            Self::Transport(_) => "transport",
        }
    }

    /// The spoken-style phrase substituted for a reply when this failure
    /// interrupts an utterance.
    pub fn fallback_phrase(&self) -> &'static str {
        match self {
            Self::Config(_) => {
                "I'm not fully set up yet. Please check my configuration and try again."
            }
            Self::Transcription(_) => "I couldn't quite catch that. Could you say it again?",
            Self::Generation(_) => {
                "I'm having trouble coming up with a response right now. Please try again in a moment."
            }
            Self::Synthesis(_) => {
                "I have an answer but I'm having trouble speaking right now."
            }
            Self::Transport(_) => "I lost my connection for a moment. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(VoiceError::Generation("x".into()).kind(), "generation");
        assert_eq!(VoiceError::Transport("x".into()).kind(), "transport");
    }

    #[test]
    fn every_variant_has_a_fallback_phrase() {
        let errors = [
            VoiceError::Config(String::new()),
            VoiceError::Transcription(String::new()),
            VoiceError::Generation(String::new()),
            VoiceError::Synthesis(String::new()),
            VoiceError::Transport(String::new()),
        ];
        for err in errors {
            assert!(!err.fallback_phrase().is_empty());
        }
    }
}
