//! Turn detection and duplicate suppression.
//!
//! The STT backend reports provisional turns; not every one is a new user
//! utterance. The buffer gates on the end-of-turn and formatted flags,
//! normalizes the transcript, and suppresses re-emission of the same
//! utterance when the backend fires twice in quick succession for one
//! spoken turn.
//!
//! Two pieces of mutable state, both scoped to one session: the last
//! accepted normalized text and the time it was accepted.

use std::time::{Duration, Instant};

/// Trailing characters stripped during normalization, matching what the STT
/// backend is liable to vary between near-identical turn reports.
const NORMALIZE_STRIP: &[char] = &['.', ',', '!', '?', ';', ':', ' '];

/// One complete, accepted user speech turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Transcript as reported, before normalization.
    pub text: String,
    /// Monotonic sequence number within the session.
    pub seq: u64,
}

/// Outcome of feeding one turn event to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDecision {
    /// A genuinely new utterance; run the reply pipeline.
    Accepted(Utterance),
    /// End of turn without formatting; ask the STT backend to re-format.
    RequestFormatting,
    /// Partial fragment, duplicate, empty text, or cooldown violation.
    /// Intentionally silent toward the client.
    Dropped,
}

/// Per-session turn state machine.
#[derive(Debug)]
pub struct TurnBuffer {
    cooldown: Duration,
    last_normalized: Option<String>,
    last_accepted_at: Option<Instant>,
    next_seq: u64,
}

impl TurnBuffer {
    /// Default minimum interval between accepted utterances.
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_normalized: None,
            last_accepted_at: None,
            next_seq: 0,
        }
    }

    /// Feeds one turn event, using the current time for cooldown checks.
    pub fn accept(&mut self, transcript: &str, end_of_turn: bool, is_formatted: bool) -> TurnDecision {
        self.accept_at(Instant::now(), transcript, end_of_turn, is_formatted)
    }

    /// Feeds one turn event at an explicit instant.
    ///
    /// `now` must be monotonically non-decreasing across calls for one
    /// buffer; `Instant::now()` satisfies this.
    pub fn accept_at(
        &mut self,
        now: Instant,
        transcript: &str,
        end_of_turn: bool,
        is_formatted: bool,
    ) -> TurnDecision {
        if !end_of_turn {
            return TurnDecision::Dropped;
        }
        if !is_formatted {
            return TurnDecision::RequestFormatting;
        }

        let normalized = normalize(transcript);
        if normalized.is_empty() {
            tracing::debug!("dropping empty transcript");
            return TurnDecision::Dropped;
        }
        if self.last_normalized.as_deref() == Some(normalized.as_str()) {
            tracing::debug!(transcript, "dropping duplicate transcript");
            return TurnDecision::Dropped;
        }
        if let Some(last) = self.last_accepted_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                tracing::debug!(
                    transcript,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "dropping transcript inside cooldown window"
                );
                return TurnDecision::Dropped;
            }
        }

        self.last_normalized = Some(normalized);
        self.last_accepted_at = Some(now);
        let seq = self.next_seq;
        self.next_seq += 1;

        TurnDecision::Accepted(Utterance {
            text: transcript.trim().to_string(),
            seq,
        })
    }
}

/// Lowercases and strips surrounding punctuation/whitespace so that two
/// reports of the same spoken turn compare equal.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .trim_matches(NORMALIZE_STRIP)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted(buffer: &mut TurnBuffer, now: Instant, text: &str) -> TurnDecision {
        buffer.accept_at(now, text, true, true)
    }

    #[test]
    fn partials_are_dropped() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        assert_eq!(
            buffer.accept_at(Instant::now(), "turn it", false, false),
            TurnDecision::Dropped
        );
    }

    #[test]
    fn unformatted_end_of_turn_requests_formatting() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        assert_eq!(
            buffer.accept_at(Instant::now(), "turn it on", true, false),
            TurnDecision::RequestFormatting
        );
    }

    #[test]
    fn first_formatted_turn_is_accepted_with_seq_zero() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        match formatted(&mut buffer, Instant::now(), "Turn it on.") {
            TurnDecision::Accepted(utterance) => {
                assert_eq!(utterance.text, "Turn it on.");
                assert_eq!(utterance.seq, 0);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_within_cooldown_is_suppressed() {
        // Scenario: the backend re-reports "turn it on" 500ms later.
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        let start = Instant::now();
        assert!(matches!(
            formatted(&mut buffer, start, "turn it on"),
            TurnDecision::Accepted(_)
        ));
        assert_eq!(
            formatted(&mut buffer, start + Duration::from_millis(500), "turn it on"),
            TurnDecision::Dropped
        );
    }

    #[test]
    fn duplicate_is_suppressed_even_after_cooldown() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        let start = Instant::now();
        assert!(matches!(
            formatted(&mut buffer, start, "turn it on"),
            TurnDecision::Accepted(_)
        ));
        // Same normalized text, different punctuation and case, 10s later.
        assert_eq!(
            formatted(&mut buffer, start + Duration::from_secs(10), "Turn it on!"),
            TurnDecision::Dropped
        );
    }

    #[test]
    fn distinct_turn_inside_cooldown_is_dropped() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        let start = Instant::now();
        assert!(matches!(
            formatted(&mut buffer, start, "turn it on"),
            TurnDecision::Accepted(_)
        ));
        assert_eq!(
            formatted(&mut buffer, start + Duration::from_millis(1500), "what time is it"),
            TurnDecision::Dropped
        );
    }

    #[test]
    fn distinct_turn_after_cooldown_gets_next_seq() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        let start = Instant::now();
        assert!(matches!(
            formatted(&mut buffer, start, "turn it on"),
            TurnDecision::Accepted(_)
        ));
        match formatted(&mut buffer, start + Duration::from_secs(3), "what time is it?") {
            TurnDecision::Accepted(utterance) => assert_eq!(utterance.seq, 1),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn whitespace_and_punctuation_only_is_empty() {
        let mut buffer = TurnBuffer::new(TurnBuffer::DEFAULT_COOLDOWN);
        assert_eq!(
            formatted(&mut buffer, Instant::now(), "  ?!.  "),
            TurnDecision::Dropped
        );
    }

    #[test]
    fn zero_cooldown_still_suppresses_duplicates() {
        let mut buffer = TurnBuffer::new(Duration::ZERO);
        let start = Instant::now();
        assert!(matches!(
            formatted(&mut buffer, start, "hello"),
            TurnDecision::Accepted(_)
        ));
        assert_eq!(formatted(&mut buffer, start, "hello."), TurnDecision::Dropped);
        assert!(matches!(
            formatted(&mut buffer, start, "goodbye"),
            TurnDecision::Accepted(_)
        ));
    }
}
