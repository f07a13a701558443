//! Streaming voice pipeline for the parley platform.
//!
//! Wraps the three external streaming collaborators — speech-to-text,
//! text generation, speech synthesis — behind channel- and trait-based
//! contracts, and provides the orchestration leaves that sit between them:
//! the turn buffer (what counts as a new user utterance), the phrase
//! batcher (re-chunking the generation stream into speakable units), and
//! the synthesis relay (multiplexing phrases onto one backend connection
//! and demultiplexing audio fragments back).
//!
//! The session coordinator in `parley-server` wires these together; this
//! crate never touches client connections.

pub mod batch;
pub mod config;
pub mod error;
pub mod generation;
pub mod stt;
pub mod synthesis;
pub mod turn;

pub use batch::{chunk_stream, BatchPolicy, GenerationChunk, PhraseBatcher};
pub use config::{GenerationConfig, SttConfig, SynthesisConfig};
pub use error::VoiceError;
pub use generation::{FragmentStream, Generator, HttpGenerator};
pub use stt::{SttCommand, SttEvent, SttStream, TurnEvent};
pub use synthesis::{
    AudioFragment, SynthesisBackend, SynthesisConnection, SynthesisEvent, SynthesisRelay,
    SynthesisResponse, SynthesisSummary, WsSynthesisBackend,
};
pub use turn::{TurnBuffer, TurnDecision, Utterance};
