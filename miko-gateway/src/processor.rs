//! Per-connection turn orchestration.
//!
//! A `MessageProcessor` owns every turn started on its connection: it wires
//! the producer/consumer pipeline, supervises the tasks, enforces the
//! one-streaming-turn policy by superseding the prior turn, and removes aged
//! terminal records so long-lived connections stay bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentStream;
use crate::chunker::{ChunkSplitter, DEFAULT_MIN_CHUNK_LEN};
use crate::normalizer::TextNormalizer;
use crate::pipeline::{self, PipelineContext, ProducerOutcome};
use crate::protocol::{ServerEvent, SessionId, TurnId};
use crate::supervisor::TaskSupervisor;
use crate::turn::{TurnState, TurnStatus};

/// Reason attached when a newer chat message replaces a running turn.
pub const REASON_SUPERSEDED: &str = "superseded";
/// Reason attached when the client asks for an interruption.
pub const REASON_CLIENT_REQUESTED: &str = "client_requested";
/// Reason attached when the owning connection goes away.
pub const REASON_CONNECTION_CLOSED: &str = "connection_closed";

/// Tunables for the streaming core.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Capacity of both per-turn queues.
    pub queue_capacity: usize,
    /// Minimum emitted sentence length in code points.
    pub min_chunk_len: usize,
    /// Bounded wait applied to cancellation and the end-of-stream barrier.
    pub interrupt_wait: Duration,
    /// How long terminal turn records may linger before cleanup removes them.
    pub cleanup_ttl: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            min_chunk_len: DEFAULT_MIN_CHUNK_LEN,
            interrupt_wait: Duration::from_secs(1),
            cleanup_ttl: Duration::from_secs(3600),
        }
    }
}

/// Counters exposed for the health/stats surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    pub total_turns: u64,
    pub total_interrupted: u64,
    pub active_turns: usize,
    pub stored_turns: usize,
}

#[derive(Default)]
struct TurnTable {
    turns: HashMap<TurnId, TurnState>,
    /// The turn currently streaming to the client, if any.
    current: Option<TurnId>,
    total_turns: u64,
    total_interrupted: u64,
}

/// Orchestrator for all turns on one connection.
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    connection_id: Uuid,
    user_id: String,
    settings: StreamSettings,
    normalizer: Arc<TextNormalizer>,
    table: Mutex<TurnTable>,
}

impl MessageProcessor {
    pub fn new(
        connection_id: Uuid,
        user_id: impl Into<String>,
        settings: StreamSettings,
        normalizer: Arc<TextNormalizer>,
    ) -> Self {
        let user_id = user_id.into();
        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            "MessageProcessor initialized"
        );
        Self {
            inner: Arc::new(ProcessorInner {
                connection_id,
                user_id,
                settings,
                normalizer,
                table: Mutex::new(TurnTable::default()),
            }),
        }
    }

    /// Start a new conversation turn fed by `agent_stream`.
    ///
    /// Runs opportunistic cleanup of aged terminal turns first, then
    /// supersedes any still-running turn (a conversational UI must not
    /// reject the newer message). Generates a session id when absent.
    pub async fn start_turn(
        &self,
        session_id: Option<SessionId>,
        user_input: &str,
        agent_stream: AgentStream,
    ) -> TurnId {
        self.cleanup_expired().await;

        let prior = {
            let table = self.inner.table.lock().await;
            table.current.clone()
        };
        if let Some(prior_id) = prior {
            self.interrupt(&prior_id, REASON_SUPERSEDED).await;
        }

        let turn_id = Uuid::new_v4().to_string();
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Everything below is synchronous and runs under the table lock, so
        // the spawned producer cannot observe a missing turn record: its
        // first table access blocks until the record is in place.
        let mut table = self.inner.table.lock().await;

        let capacity = self.inner.settings.queue_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(capacity);
        let (token_tx, token_rx) = mpsc::channel(capacity);
        let (drained_tx, drained_rx) = oneshot::channel();
        let (flushed_tx, flushed_rx) = oneshot::channel();

        let mut supervisor = TaskSupervisor::new();
        let cancel = supervisor.cancel_token();

        let consumer = tokio::spawn(pipeline::run_consumer(
            ChunkSplitter::new(self.inner.settings.min_chunk_len),
            self.inner.normalizer.clone(),
            token_rx,
            event_tx.clone(),
            drained_tx,
            flushed_tx,
            cancel.clone(),
        ));
        supervisor.register(consumer);

        let ctx = PipelineContext {
            turn_id: turn_id.clone(),
            session_id: session_id.clone(),
            interrupt_wait: self.inner.settings.interrupt_wait,
        };
        let inner = Arc::clone(&self.inner);
        let producer_turn_id = turn_id.clone();
        let producer_event_tx = event_tx.clone();
        let producer = tokio::spawn(async move {
            let outcome = pipeline::run_producer(
                ctx,
                agent_stream,
                token_tx,
                producer_event_tx,
                drained_rx,
                flushed_rx,
                cancel,
            )
            .await;
            inner.apply_outcome(&producer_turn_id, outcome).await;
        });
        supervisor.register(producer);

        let mut turn = TurnState::new(
            turn_id.clone(),
            session_id.clone(),
            user_input.to_string(),
            event_tx,
            event_rx,
            supervisor,
        );
        turn.advance(TurnStatus::Running);
        table.turns.insert(turn_id.clone(), turn);
        table.current = Some(turn_id.clone());
        table.total_turns += 1;
        info!(
            connection_id = %self.inner.connection_id,
            turn_id = %turn_id,
            session_id = %session_id,
            "Started conversation turn"
        );

        turn_id
    }

    /// Take the turn's outbound event receiver. Lazy, finite, and not
    /// restartable: a second call for the same turn fails.
    pub async fn stream_events(&self, turn_id: &str) -> Result<mpsc::Receiver<ServerEvent>> {
        let mut table = self.inner.table.lock().await;
        let Some(turn) = table.turns.get_mut(turn_id) else {
            bail!("unknown turn: {}", turn_id);
        };
        match turn.event_rx.take() {
            Some(rx) => Ok(rx),
            None => bail!("events for turn {} already streamed", turn_id),
        }
    }

    /// Interrupt a turn: cancel its tasks with a bounded wait and emit a
    /// final `interrupted` event. Idempotent on terminal turns.
    ///
    /// Returns `true` when the turn was actually interrupted by this call.
    pub async fn interrupt(&self, turn_id: &str, reason: &str) -> bool {
        let (mut supervisor, event_tx, session_id) = {
            let mut table = self.inner.table.lock().await;
            let Some(turn) = table.turns.get_mut(turn_id) else {
                debug!(turn_id = %turn_id, "Interrupt requested for unknown turn");
                return false;
            };
            if turn.status.is_terminal() {
                debug!(turn_id = %turn_id, "Interrupt requested for finished turn");
                return false;
            }
            let event_tx = turn.event_tx.clone();
            turn.advance(TurnStatus::Interrupted);
            table.total_interrupted += 1;
            if table.current.as_deref() == Some(turn_id) {
                table.current = None;
            }
            let turn = table.turns.get_mut(turn_id).expect("turn present");
            (
                std::mem::take(&mut turn.supervisor),
                event_tx,
                turn.session_id.clone(),
            )
        };

        let cooperative = supervisor
            .cancel_and_wait(self.inner.settings.interrupt_wait)
            .await;
        if !cooperative {
            warn!(
                connection_id = %self.inner.connection_id,
                turn_id = %turn_id,
                "Forced cancellation while interrupting turn"
            );
        }

        if let Some(tx) = event_tx {
            let event = ServerEvent::Interrupted {
                turn_id: turn_id.to_string(),
                reason: reason.to_string(),
            };
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                // Queue full: give the drainer a bounded chance to make room
                // so the terminal event is not lost.
                let _ = tokio::time::timeout(self.inner.settings.interrupt_wait, tx.send(event))
                    .await;
            }
        }

        info!(
            connection_id = %self.inner.connection_id,
            turn_id = %turn_id,
            session_id = %session_id,
            reason = %reason,
            "Interrupted turn"
        );
        true
    }

    /// Interrupt every non-terminal turn. Returns how many were interrupted.
    pub async fn interrupt_all(&self, reason: &str) -> usize {
        let active: Vec<TurnId> = {
            let table = self.inner.table.lock().await;
            table
                .turns
                .iter()
                .filter(|(_, turn)| !turn.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut interrupted = 0;
        for turn_id in active {
            if self.interrupt(&turn_id, reason).await {
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Interrupt all active turns, await their tasks, and drop every record.
    pub async fn shutdown(&self) {
        info!(
            connection_id = %self.inner.connection_id,
            "Shutting down MessageProcessor"
        );
        self.interrupt_all(REASON_CONNECTION_CLOSED).await;

        let turns: Vec<TurnState> = {
            let mut table = self.inner.table.lock().await;
            table.current = None;
            table.turns.drain().map(|(_, turn)| turn).collect()
        };
        for mut turn in turns {
            turn.supervisor
                .join_all(self.inner.settings.interrupt_wait)
                .await;
        }
    }

    /// Remove terminal turns older than `cleanup_ttl`. Triggered on every
    /// `start_turn` so long-lived connections cannot accumulate records.
    pub async fn cleanup_expired(&self) {
        let ttl = self.inner.settings.cleanup_ttl;
        let expired: Vec<TurnState> = {
            let mut table = self.inner.table.lock().await;
            let expired_ids: Vec<TurnId> = table
                .turns
                .iter()
                .filter(|(_, turn)| {
                    turn.status.is_terminal()
                        && turn.finished_age().map(|age| age >= ttl).unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .iter()
                .filter_map(|id| table.turns.remove(id))
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        let count = expired.len();
        for mut turn in expired {
            // Terminal turns have finished pipelines; this is a fast join
            // that guarantees no task outlives its record.
            turn.supervisor
                .join_all(self.inner.settings.interrupt_wait)
                .await;
        }
        info!(
            connection_id = %self.inner.connection_id,
            removed = count,
            "Cleaned up aged turn records"
        );
    }

    /// Status of one turn, if its record still exists.
    pub async fn turn_status(&self, turn_id: &str) -> Option<TurnStatus> {
        let table = self.inner.table.lock().await;
        table.turns.get(turn_id).map(|turn| turn.status)
    }

    /// Final aggregated content of one turn.
    pub async fn turn_content(&self, turn_id: &str) -> Option<String> {
        let table = self.inner.table.lock().await;
        table
            .turns
            .get(turn_id)
            .map(|turn| turn.aggregate_content.clone())
    }

    /// Original user input of one turn.
    pub async fn turn_user_input(&self, turn_id: &str) -> Option<String> {
        let table = self.inner.table.lock().await;
        table
            .turns
            .get(turn_id)
            .map(|turn| turn.user_input.clone())
    }

    /// Ids of all non-terminal turns.
    pub async fn active_turn_ids(&self) -> Vec<TurnId> {
        let table = self.inner.table.lock().await;
        table
            .turns
            .iter()
            .filter(|(_, turn)| !turn.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn stats(&self) -> ProcessorStats {
        let table = self.inner.table.lock().await;
        ProcessorStats {
            total_turns: table.total_turns,
            total_interrupted: table.total_interrupted,
            active_turns: table
                .turns
                .values()
                .filter(|turn| !turn.status.is_terminal())
                .count(),
            stored_turns: table.turns.len(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }
}

impl ProcessorInner {
    /// Apply the producer's terminal outcome to the turn record.
    async fn apply_outcome(&self, turn_id: &str, outcome: ProducerOutcome) {
        let mut table = self.table.lock().await;
        let Some(turn) = table.turns.get_mut(turn_id) else {
            return;
        };
        match outcome {
            ProducerOutcome::Completed { content } => {
                if turn.advance(TurnStatus::Completed) {
                    turn.aggregate_content = content;
                    info!(
                        connection_id = %self.connection_id,
                        turn_id = %turn_id,
                        duration_ms = turn.created_at.elapsed().as_millis() as u64,
                        "Completed turn"
                    );
                }
            }
            ProducerOutcome::Failed { error } => {
                if turn.advance(TurnStatus::Failed) {
                    warn!(
                        connection_id = %self.connection_id,
                        turn_id = %turn_id,
                        error = %error,
                        "Turn failed"
                    );
                }
            }
            // Interruption already advanced the status.
            ProducerOutcome::Cancelled => {}
        }
        if table.current.as_deref() == Some(turn_id) {
            let done = table
                .turns
                .get(turn_id)
                .map(|turn| turn.status.is_terminal())
                .unwrap_or(true);
            if done {
                table.current = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, AgentSink, AgentStream};
    use crate::protocol::CODE_INTERNAL;
    use std::time::Instant;

    fn processor(settings: StreamSettings) -> MessageProcessor {
        MessageProcessor::new(
            Uuid::new_v4(),
            "user-1",
            settings,
            Arc::new(TextNormalizer::with_default_rules()),
        )
    }

    fn start() -> AgentEvent {
        AgentEvent::StreamStart {
            turn_id: "agent-turn".into(),
            session_id: "agent-session".into(),
        }
    }

    fn token(chunk: &str) -> AgentEvent {
        AgentEvent::StreamToken {
            chunk: chunk.into(),
            node: None,
        }
    }

    fn end(content: &str) -> AgentEvent {
        AgentEvent::StreamEnd {
            turn_id: "agent-turn".into(),
            session_id: "agent-session".into(),
            content: content.into(),
        }
    }

    async fn collect_events(mut rx: mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
            match next {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => panic!("timed out waiting for events: {:?}", events),
            }
        }
        events
    }

    /// An agent stream that emits a prologue and then stalls until dropped,
    /// for interruption scenarios.
    fn stalling_stream(prologue: Vec<AgentEvent>) -> AgentStream {
        let (sink, stream) = AgentStream::channel(8);
        tokio::spawn(async move {
            for event in prologue {
                if !sink.send(event).await {
                    return;
                }
            }
            sink.cancelled().await;
        });
        stream
    }

    // --- Happy path ---

    #[tokio::test]
    async fn test_happy_path_stream() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![
            Ok(start()),
            Ok(token("Hello")),
            Ok(token(" there.")),
            Ok(token(" How are you?")),
            Ok(end("Hello there. How are you?")),
        ]);

        let turn_id = processor
            .start_turn(Some("sess-1".into()), "Hi", stream)
            .await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        assert_eq!(
            events,
            vec![
                ServerEvent::StreamStart {
                    turn_id: turn_id.clone(),
                    session_id: "sess-1".into(),
                },
                ServerEvent::TtsReadyChunk {
                    chunk: "Hello there.".into(),
                    emotion: None,
                },
                ServerEvent::TtsReadyChunk {
                    chunk: "How are you?".into(),
                    emotion: None,
                },
                ServerEvent::StreamEnd {
                    turn_id: turn_id.clone(),
                    session_id: "sess-1".into(),
                    content: "Hello there. How are you?".into(),
                },
            ]
        );

        assert_eq!(
            processor.turn_status(&turn_id).await,
            Some(TurnStatus::Completed)
        );
        assert_eq!(
            processor.turn_content(&turn_id).await.unwrap(),
            "Hello there. How are you?"
        );
    }

    #[tokio::test]
    async fn test_session_id_generated_when_absent() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![Ok(start()), Ok(end(""))]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        match &events[0] {
            ServerEvent::StreamStart { session_id, .. } => {
                assert!(Uuid::parse_str(session_id).is_ok());
            }
            other => panic!("Expected StreamStart, got {:?}", other),
        }
    }

    // --- Terminal-event ordering ---

    #[tokio::test]
    async fn test_stream_start_first_and_terminal_last() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![
            Ok(start()),
            Ok(token("One sentence here. ")),
            Ok(token("Another sentence too.")),
            Ok(end("One sentence here. Another sentence too.")),
        ]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        assert!(matches!(events.first(), Some(ServerEvent::StreamStart { .. })));
        assert!(matches!(events.last(), Some(ServerEvent::StreamEnd { .. })));
        let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminal_count, 1);
    }

    // --- Tool invisibility ---

    #[tokio::test]
    async fn test_tool_events_invisible_to_client() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![
            Ok(start()),
            Ok(AgentEvent::ToolCall {
                tool_name: "search".into(),
                args: "{}".into(),
                node: None,
            }),
            Ok(AgentEvent::ToolResult {
                result: "ok".into(),
                node: None,
            }),
            Ok(token("Done and dusted.")),
            Ok(end("Done and dusted.")),
        ]);
        let turn_id = processor.start_turn(None, "go", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], ServerEvent::TtsReadyChunk { ref chunk, .. } if chunk == "Done and dusted."));
    }

    // --- Interruption ---

    #[tokio::test]
    async fn test_interrupt_mid_stream() {
        let processor = processor(StreamSettings::default());
        let stream = stalling_stream(vec![start(), token("First bit. "), token("more")]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();

        // Let the prologue flow.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert!(processor.interrupt(&turn_id, REASON_CLIENT_REQUESTED).await);
        assert!(started.elapsed() < Duration::from_millis(1500));

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(ServerEvent::Interrupted { reason, .. }) if reason == REASON_CLIENT_REQUESTED
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::StreamEnd { .. })));
        assert_eq!(
            processor.turn_status(&turn_id).await,
            Some(TurnStatus::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_interrupt_is_idempotent() {
        let processor = processor(StreamSettings::default());
        let stream = stalling_stream(vec![start()]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;

        assert!(processor.interrupt(&turn_id, REASON_CLIENT_REQUESTED).await);
        assert!(!processor.interrupt(&turn_id, REASON_CLIENT_REQUESTED).await);
        assert!(!processor.interrupt(&turn_id, "again").await);

        let stats = processor.stats().await;
        assert_eq!(stats.total_interrupted, 1);
    }

    #[tokio::test]
    async fn test_interrupt_unknown_turn_is_noop() {
        let processor = processor(StreamSettings::default());
        assert!(!processor.interrupt("no-such-turn", "whatever").await);
    }

    #[tokio::test]
    async fn test_interrupt_completed_turn_is_noop() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![Ok(start()), Ok(end("done"))]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        collect_events(rx).await;

        assert!(!processor.interrupt(&turn_id, "late").await);
        assert_eq!(
            processor.turn_status(&turn_id).await,
            Some(TurnStatus::Completed)
        );
    }

    // --- Superseding ---

    #[tokio::test]
    async fn test_new_chat_supersedes_running_turn() {
        let processor = processor(StreamSettings::default());
        let first = stalling_stream(vec![start(), token("thinking out loud")]);
        let first_id = processor.start_turn(None, "first", first).await;
        let first_rx = processor.stream_events(&first_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = AgentStream::scripted(vec![Ok(start()), Ok(end("second answer"))]);
        let second_id = processor.start_turn(None, "second", second).await;
        assert_ne!(first_id, second_id);

        let first_events = collect_events(first_rx).await;
        assert!(matches!(
            first_events.last(),
            Some(ServerEvent::Interrupted { reason, turn_id })
                if reason == REASON_SUPERSEDED && *turn_id == first_id
        ));

        let second_rx = processor.stream_events(&second_id).await.unwrap();
        let second_events = collect_events(second_rx).await;
        assert!(matches!(
            second_events.last(),
            Some(ServerEvent::StreamEnd { .. })
        ));

        assert_eq!(
            processor.turn_status(&first_id).await,
            Some(TurnStatus::Interrupted)
        );
        assert_eq!(
            processor.turn_status(&second_id).await,
            Some(TurnStatus::Completed)
        );
    }

    // --- Failure path ---

    #[tokio::test]
    async fn test_agent_error_marks_turn_failed() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![
            Ok(start()),
            Err(anyhow::anyhow!("upstream blew up")),
        ]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        assert!(matches!(
            events.last(),
            Some(ServerEvent::Error { code, .. }) if *code == CODE_INTERNAL
        ));
        assert_eq!(
            processor.turn_status(&turn_id).await,
            Some(TurnStatus::Failed)
        );
    }

    // --- Cleanup ---

    #[tokio::test]
    async fn test_start_turn_removes_aged_terminal_records() {
        let settings = StreamSettings {
            cleanup_ttl: Duration::ZERO,
            ..StreamSettings::default()
        };
        let processor = processor(settings);

        let first = AgentStream::scripted(vec![Ok(start()), Ok(end("one"))]);
        let first_id = processor.start_turn(None, "one", first).await;
        let rx = processor.stream_events(&first_id).await.unwrap();
        collect_events(rx).await;
        assert_eq!(
            processor.turn_status(&first_id).await,
            Some(TurnStatus::Completed)
        );

        let second = AgentStream::scripted(vec![Ok(start()), Ok(end("two"))]);
        let second_id = processor.start_turn(None, "two", second).await;

        assert!(processor.turn_status(&first_id).await.is_none());
        assert!(processor.turn_status(&second_id).await.is_some());
    }

    #[tokio::test]
    async fn test_fresh_terminal_records_survive_cleanup() {
        let processor = processor(StreamSettings::default());
        let first = AgentStream::scripted(vec![Ok(start()), Ok(end("one"))]);
        let first_id = processor.start_turn(None, "one", first).await;
        let rx = processor.stream_events(&first_id).await.unwrap();
        collect_events(rx).await;

        let second = AgentStream::scripted(vec![Ok(start()), Ok(end("two"))]);
        processor.start_turn(None, "two", second).await;

        // Default TTL is an hour; the completed record must still be there.
        assert_eq!(
            processor.turn_status(&first_id).await,
            Some(TurnStatus::Completed)
        );
    }

    // --- Stream handle semantics ---

    #[tokio::test]
    async fn test_stream_events_not_restartable() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![Ok(start()), Ok(end(""))]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;

        assert!(processor.stream_events(&turn_id).await.is_ok());
        assert!(processor.stream_events(&turn_id).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_events_unknown_turn_fails() {
        let processor = processor(StreamSettings::default());
        assert!(processor.stream_events("missing").await.is_err());
    }

    // --- Shutdown ---

    #[tokio::test]
    async fn test_shutdown_interrupts_and_clears() {
        let processor = processor(StreamSettings::default());
        let stream = stalling_stream(vec![start(), token("never ends")]);
        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();

        processor.shutdown().await;

        let events = collect_events(rx).await;
        assert!(matches!(
            events.last(),
            Some(ServerEvent::Interrupted { reason, .. }) if reason == REASON_CONNECTION_CLOSED
        ));
        let stats = processor.stats().await;
        assert_eq!(stats.stored_turns, 0);
        assert_eq!(stats.active_turns, 0);
    }

    // --- Stats ---

    #[tokio::test]
    async fn test_stats_track_turn_counts() {
        let processor = processor(StreamSettings::default());
        let stream = AgentStream::scripted(vec![Ok(start()), Ok(end("a"))]);
        let turn_id = processor.start_turn(None, "a", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        collect_events(rx).await;

        let stats = processor.stats().await;
        assert_eq!(stats.total_turns, 1);
        assert_eq!(stats.total_interrupted, 0);
        assert_eq!(stats.active_turns, 0);
        assert_eq!(stats.stored_turns, 1);
        assert_eq!(processor.turn_user_input(&turn_id).await.as_deref(), Some("a"));
    }

    // --- Backpressure ---

    #[tokio::test]
    async fn test_token_queue_capacity_bounds_inflight_tokens() {
        let settings = StreamSettings {
            queue_capacity: 2,
            ..StreamSettings::default()
        };
        let processor = processor(settings);

        // Feed ten tokens through a capacity-1 upstream channel and count
        // completed sends. The consumer is alive here, so everything flows,
        // but the queue bound still holds: the feeder can only ever be one
        // hop ahead of the pipeline.
        let (sink, stream) = AgentStream::channel(1);
        let feeder: tokio::task::JoinHandle<AgentSink> = tokio::spawn(async move {
            sink.send(start()).await;
            for i in 0..10 {
                if !sink
                    .send(token(&format!("word{} and filler text. ", i)))
                    .await
                {
                    break;
                }
            }
            sink.send(end("all ten")).await;
            sink
        });

        let turn_id = processor.start_turn(None, "Hi", stream).await;
        let rx = processor.stream_events(&turn_id).await.unwrap();
        let events = collect_events(rx).await;

        assert!(matches!(events.last(), Some(ServerEvent::StreamEnd { .. })));
        let chunk_count = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::TtsReadyChunk { .. }))
            .count();
        assert_eq!(chunk_count, 10);
        feeder.await.unwrap();
    }
}
