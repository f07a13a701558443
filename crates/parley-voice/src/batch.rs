//! Re-chunking of the generation stream into speakable phrases.
//!
//! The generation backend emits fragments at token granularity; the
//! synthesis backend sounds best when fed phrase-sized units. The batcher
//! accumulates fragments and flushes on size and punctuation heuristics,
//! with a time-based fallback so a slow generator never stalls audio.
//!
//! Guarantee: concatenating the emitted chunk texts reproduces the input
//! exactly, and no chunk boundary falls inside a word except the forced
//! final flush.

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use std::time::{Duration, Instant};

/// Characters that end a sentence and force a flush regardless of length.
const SENTENCE_TERMINATORS: [char; 4] = ['.', '!', '?', '\n'];

/// A contiguous span of generated text queued for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationChunk {
    pub text: String,
    /// Marks the last chunk of one utterance's reply. A final chunk may be
    /// empty, in which case it carries only the end signal.
    pub is_final: bool,
}

/// Flush thresholds. Workload-dependent; see the session configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    /// Minimum accumulated length before a word-boundary flush.
    pub min_chars: usize,
    /// Time-based flush fallback since the last flush.
    pub flush_interval: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            min_chars: 60,
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// Synchronous batching core, driven by [`chunk_stream`] or directly by
/// tests. Holds the text accumulated since the last flush.
#[derive(Debug)]
pub struct PhraseBatcher {
    policy: BatchPolicy,
    buffer: String,
    last_flush: Instant,
}

impl PhraseBatcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            buffer: String::new(),
            last_flush: Instant::now(),
        }
    }

    /// Appends a fragment and flushes if the policy says so.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.push_at(Instant::now(), fragment)
    }

    /// Appends a fragment at an explicit instant.
    pub fn push_at(&mut self, now: Instant, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        self.flush_if_due(now)
    }

    /// Timer tick: flushes on the time-based fallback alone.
    pub fn poll(&mut self) -> Option<String> {
        self.poll_at(Instant::now())
    }

    /// Timer tick at an explicit instant.
    pub fn poll_at(&mut self, now: Instant) -> Option<String> {
        self.flush_if_due(now)
    }

    /// Upstream exhausted: returns whatever remains, even mid-word.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn flush_if_due(&mut self, now: Instant) -> Option<String> {
        if self.buffer.is_empty() || !self.at_boundary() {
            return None;
        }

        let due = self.ends_with_terminator()
            || self.buffer.chars().count() >= self.policy.min_chars
            || now.saturating_duration_since(self.last_flush) >= self.policy.flush_interval;

        if due {
            self.last_flush = now;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// True when the buffer ends on whitespace or a sentence terminator,
    /// i.e. a cut here cannot split a word.
    fn at_boundary(&self) -> bool {
        match self.buffer.chars().last() {
            Some(c) => c.is_whitespace() || SENTENCE_TERMINATORS.contains(&c),
            None => false,
        }
    }

    fn ends_with_terminator(&self) -> bool {
        self.buffer
            .trim_end_matches(' ')
            .ends_with(SENTENCE_TERMINATORS)
    }
}

/// Adapts a fragment stream into a [`GenerationChunk`] stream, driving the
/// batching core with a flush timer.
///
/// The last chunk always carries `is_final = true`; when the buffer is empty
/// at exhaustion but chunks were already emitted, a zero-length final chunk
/// is emitted so downstream consumers still see the end signal.
pub fn chunk_stream<S>(policy: BatchPolicy, input: S) -> impl Stream<Item = GenerationChunk>
where
    S: Stream<Item = String>,
{
    enum Step {
        Fragment(Option<String>),
        Tick,
    }

    stream! {
        let mut batcher = PhraseBatcher::new(policy);
        let mut emitted = false;
        let mut deadline = tokio::time::Instant::now() + policy.flush_interval;
        tokio::pin!(input);

        loop {
            let step = tokio::select! {
                fragment = input.next() => Step::Fragment(fragment),
                _ = tokio::time::sleep_until(deadline) => Step::Tick,
            };
            let flushed = match step {
                Step::Fragment(Some(text)) => {
                    let flushed = batcher.push(&text);
                    if flushed.is_some() {
                        deadline = tokio::time::Instant::now() + policy.flush_interval;
                    }
                    flushed
                }
                Step::Fragment(None) => break,
                Step::Tick => {
                    deadline = tokio::time::Instant::now() + policy.flush_interval;
                    batcher.poll()
                }
            };
            if let Some(chunk) = flushed {
                emitted = true;
                yield GenerationChunk { text: chunk, is_final: false };
            }
        }

        match batcher.finish() {
            Some(rest) => yield GenerationChunk { text: rest, is_final: true },
            None if emitted => yield GenerationChunk { text: String::new(), is_final: true },
            None => {}
        }
    }
}
