//! End-to-end pipeline tests with scripted collaborators.
//!
//! The STT, generation, and synthesis backends are replaced by in-process
//! fakes wired through the same channel and trait seams the real clients
//! use; everything from the turn buffer to the client event stream is the
//! production code path.

use async_trait::async_trait;
use parley_history::{HistoryStore, MemoryHistory};
use parley_server::api_ws::{ClientEvent, ConnectionRegistry};
use parley_server::session::{run_session, SessionRegistry};
use parley_server::{AppState, SessionSettings};
use parley_types::Role;
use parley_voice::stt::{SttCommand, SttEvent, SttStream, TurnEvent};
use parley_voice::synthesis::{
    PhraseSubmission, SynthesisBackend, SynthesisConnection, SynthesisResponse,
};
use parley_voice::{BatchPolicy, FragmentStream, Generator, SttConfig, VoiceError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Generator that streams a fixed fragment script.
struct ScriptedGenerator {
    fragments: Vec<&'static str>,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn stream_reply(
        &self,
        _prompt: &str,
        _history: &[parley_types::ConversationMessage],
    ) -> Result<FragmentStream, VoiceError> {
        let fragments: Vec<Result<String, VoiceError>> =
            self.fragments.iter().map(|s| Ok(s.to_string())).collect();
        Ok(Box::pin(futures_util::stream::iter(fragments)))
    }
}

/// Generator that fails before producing anything.
struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn stream_reply(
        &self,
        _prompt: &str,
        _history: &[parley_types::ConversationMessage],
    ) -> Result<FragmentStream, VoiceError> {
        Err(VoiceError::Generation("backend unavailable".to_string()))
    }
}

/// Answers one audio response per phrase and a final response on `end`.
fn spawn_echo_connection() -> SynthesisConnection {
    let (req_tx, mut req_rx) = mpsc::channel::<PhraseSubmission>(8);
    let (resp_tx, resp_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(phrase) = req_rx.recv().await {
            if !phrase.text.is_empty() {
                let _ = resp_tx
                    .send(Ok(SynthesisResponse::Audio {
                        audio: format!("b64:{}", phrase.text),
                        is_final: false,
                    }))
                    .await;
            }
            if phrase.end {
                let _ = resp_tx
                    .send(Ok(SynthesisResponse::Audio {
                        audio: "b64:tail".to_string(),
                        is_final: true,
                    }))
                    .await;
                break;
            }
        }
    });
    SynthesisConnection::from_parts(req_tx, resp_rx)
}

struct EchoBackend;

#[async_trait]
impl SynthesisBackend for EchoBackend {
    async fn open(&self) -> Result<SynthesisConnection, VoiceError> {
        Ok(spawn_echo_connection())
    }
}

/// First `failures` opens yield a connection that emits two fragments and
/// then dies; later opens behave like [`EchoBackend`].
struct FlakyBackend {
    failures: AtomicUsize,
}

#[async_trait]
impl SynthesisBackend for FlakyBackend {
    async fn open(&self) -> Result<SynthesisConnection, VoiceError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Ok(spawn_echo_connection());
        }
        let (req_tx, mut req_rx) = mpsc::channel::<PhraseSubmission>(8);
        let (resp_tx, resp_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _ = req_rx.recv().await;
            for i in 0..2 {
                let _ = resp_tx
                    .send(Ok(SynthesisResponse::Audio {
                        audio: format!("b64:{i}"),
                        is_final: false,
                    }))
                    .await;
            }
            let _ = resp_tx
                .send(Err(VoiceError::Transport("backend reset".to_string())))
                .await;
        });
        Ok(SynthesisConnection::from_parts(req_tx, resp_rx))
    }
}

fn test_state(
    generator: Arc<dyn Generator>,
    synthesis: Arc<dyn SynthesisBackend>,
    cooldown: Duration,
) -> Arc<AppState> {
    Arc::new(AppState {
        connections: ConnectionRegistry::new(),
        sessions: SessionRegistry::new(synthesis),
        history: Arc::new(MemoryHistory::new()),
        generator,
        stt_config: SttConfig::default(),
        settings: SessionSettings {
            cooldown,
            batch: BatchPolicy::default(),
            audio_ack_every: 10,
            synthesis_idle: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        },
    })
}

struct Harness {
    state: Arc<AppState>,
    client_rx: mpsc::Receiver<ClientEvent>,
    stt_tx: mpsc::Sender<SttEvent>,
    commands: mpsc::Receiver<SttCommand>,
}

const SESSION: &str = "s-test";

async fn start(state: Arc<AppState>) -> Harness {
    let (tx, client_rx) = mpsc::channel(256);
    let conn_id = state.connections.register(tx).await;
    let session = state.sessions.get_or_create(SESSION).await;
    session.attach(conn_id);

    let (stt, commands) = SttStream::channel(32);
    let (stt_tx, stt_rx) = mpsc::channel(32);
    tokio::spawn(run_session(state.clone(), session, conn_id, stt, stt_rx));

    Harness {
        state,
        client_rx,
        stt_tx,
        commands,
    }
}

impl Harness {
    async fn turn(&self, text: &str) {
        self.stt_tx
            .send(SttEvent::Turn(TurnEvent {
                transcript: text.to_string(),
                end_of_turn: true,
                turn_is_formatted: true,
            }))
            .await
            .unwrap();
    }

    /// Collects client events until `pred` matches (inclusive).
    async fn collect_until(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), self.client_rx.recv())
                .await
                .expect("timed out waiting for client event")
                .expect("client channel closed");
            let done = pred(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    }
}

fn is_turn_complete(event: &ClientEvent) -> bool {
    matches!(event, ClientEvent::TurnComplete { .. })
}

fn is_error(event: &ClientEvent) -> bool {
    matches!(event, ClientEvent::Error { .. })
}

fn position_of(events: &[ClientEvent], pred: impl Fn(&ClientEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

#[tokio::test]
async fn one_turn_runs_the_full_pipeline_in_order() {
    let state = test_state(
        Arc::new(ScriptedGenerator {
            fragments: vec!["Hi", " there", ".", " That is all."],
        }),
        Arc::new(EchoBackend),
        Duration::from_secs(2),
    );
    let mut harness = start(state).await;

    harness.turn("hello agent").await;
    let events = harness.collect_until(is_turn_complete).await;

    // Transcript precedes everything the turn triggered.
    assert!(matches!(events[0], ClientEvent::Transcript { .. }));

    // Chunk text reaches the client before any audio derived from it.
    let first_text = position_of(&events, |e| matches!(e, ClientEvent::AiResponse { .. }))
        .expect("expected ai_response events");
    let first_audio = position_of(&events, |e| matches!(e, ClientEvent::AudioChunk { .. }))
        .expect("expected audio_chunk events");
    assert!(first_text < first_audio);

    // The streamed text reassembles the full reply.
    let reply: String = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::AiResponse { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reply, "Hi there. That is all.");

    // Audio fragments arrive indexed, exactly one final, as the last one.
    let audio: Vec<(u64, bool)> = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::AudioChunk {
                chunk_index,
                is_final,
                ..
            } => Some((*chunk_index, *is_final)),
            _ => None,
        })
        .collect();
    assert!(!audio.is_empty());
    for (i, (index, _)) in audio.iter().enumerate() {
        assert_eq!(*index, i as u64);
    }
    assert_eq!(audio.iter().filter(|(_, f)| *f).count(), 1);
    assert!(audio.last().unwrap().1);

    // History holds exactly user + assistant, in order.
    let log = harness.state.history.get(SESSION).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[0].text, "hello agent");
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].text, "Hi there. That is all.");
}

#[tokio::test]
async fn duplicate_turns_produce_one_utterance() {
    // Scenario: two identical "turn it on" reports 0.5s apart — the
    // second never reaches history.
    let state = test_state(
        Arc::new(ScriptedGenerator {
            fragments: vec!["Okay, it's on."],
        }),
        Arc::new(EchoBackend),
        Duration::from_secs(2),
    );
    let mut harness = start(state).await;

    harness.turn("turn it on").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.turn("turn it on").await;

    harness.collect_until(is_turn_complete).await;
    // Give a wrongly-accepted second utterance time to surface.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let log = harness.state.history.get(SESSION).await.unwrap();
    assert_eq!(log.len(), 2, "one user and one assistant message only");
    assert_eq!(log[0].text, "turn it on");
}

#[tokio::test]
async fn synthesis_error_recovers_for_the_next_utterance() {
    // Scenario: synthesis dies after two fragments. The client hears both
    // fragments plus an error; history still records the full text; the
    // session takes the next utterance normally.
    let state = test_state(
        Arc::new(ScriptedGenerator {
            fragments: vec!["Here is a longer reply that synthesis will drop."],
        }),
        Arc::new(FlakyBackend {
            failures: AtomicUsize::new(1),
        }),
        Duration::ZERO,
    );
    let mut harness = start(state).await;

    harness.turn("say something").await;
    let events = harness.collect_until(is_error).await;

    let audio_count = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::AudioChunk { .. }))
        .count();
    assert_eq!(audio_count, 2);
    match events.last().unwrap() {
        ClientEvent::Error { kind, .. } => assert_eq!(kind, "transport"),
        other => panic!("expected error event, got {other:?}"),
    }

    let log = harness.state.history.get(SESSION).await.unwrap();
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].text, "Here is a longer reply that synthesis will drop.");

    // Session stays usable: a distinct turn completes with audio.
    harness.turn("and now say more").await;
    let events = harness.collect_until(is_turn_complete).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::AudioChunk { is_final: true, .. })));

    let log = harness.state.history.get(SESSION).await.unwrap();
    assert_eq!(log.len(), 4);
}

#[tokio::test]
async fn generation_failure_substitutes_the_fallback_reply() {
    let state = test_state(
        Arc::new(FailingGenerator),
        Arc::new(EchoBackend),
        Duration::from_secs(2),
    );
    let mut harness = start(state).await;

    harness.turn("hello?").await;
    let events = harness
        .collect_until(|e| matches!(e, ClientEvent::AiResponse { .. }))
        .await;

    assert!(events.iter().any(is_error), "client must hear about the failure");

    let fallback = VoiceError::Generation(String::new())
        .fallback_phrase()
        .to_string();
    match events.last().unwrap() {
        ClientEvent::AiResponse { text } => assert_eq!(*text, fallback),
        other => panic!("expected fallback text, got {other:?}"),
    }

    // Roles stay consistent: the fallback is recorded as the assistant.
    let log = harness.state.history.get(SESSION).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].text, fallback);
}

#[tokio::test]
async fn unformatted_end_of_turn_requests_formatting() {
    let state = test_state(
        Arc::new(ScriptedGenerator { fragments: vec![] }),
        Arc::new(EchoBackend),
        Duration::from_secs(2),
    );
    let mut harness = start(state).await;

    harness
        .stt_tx
        .send(SttEvent::Turn(TurnEvent {
            transcript: "turn it on".to_string(),
            end_of_turn: true,
            turn_is_formatted: false,
        }))
        .await
        .unwrap();

    let command = timeout(Duration::from_secs(5), harness.commands.recv())
        .await
        .expect("timed out waiting for stt command")
        .expect("stt command channel closed");
    assert_eq!(command, SttCommand::Configure { format_turns: true });

    // Nothing reached history: the turn was never accepted.
    assert!(harness.state.history.get(SESSION).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweeper_discards_disconnected_sessions_and_clears_history() {
    let state = test_state(
        Arc::new(ScriptedGenerator { fragments: vec![] }),
        Arc::new(EchoBackend),
        Duration::from_secs(2),
    );
    // Zero idle timeout: anything disconnected is immediately reclaimable.
    let state = Arc::new(AppState {
        settings: SessionSettings {
            idle_timeout: Duration::ZERO,
            ..state.settings
        },
        ..(*state).clone()
    });

    state.sessions.get_or_create("stale").await;
    state
        .history
        .append("stale", Role::User, "anyone there?")
        .await
        .unwrap();
    assert_eq!(state.sessions.len().await, 1);

    parley_server::background::sweep_once(&state).await;

    assert_eq!(state.sessions.len().await, 0);
    assert!(state.history.get("stale").await.unwrap().is_empty());
}
