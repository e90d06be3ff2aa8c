//! The per-turn event pipeline: two cooperating tasks joined by bounded
//! queues.
//!
//! The *producer* drains the agent event stream. Tokens go onto the bounded
//! token queue (the backpressure point that throttles the agent), lifecycle
//! events go straight onto the client-bound event queue, and tool traffic is
//! logged but never forwarded. The *consumer* turns queued tokens into
//! normalized, sentence-sized `tts_ready_chunk` events.
//!
//! End-of-stream is a two-phase barrier. On `stream_end` the producer
//! enqueues the end-of-tokens sentinel, then waits first for the consumer to
//! drain the token queue and second for the consumer's post-drain flush to
//! complete, each bounded by the interrupt wait. Only then does `stream_end`
//! go onto the event queue, so no late `tts_ready_chunk` can trail the
//! terminal event.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, AgentStream};
use crate::chunker::ChunkSplitter;
use crate::normalizer::TextNormalizer;
use crate::protocol::{ServerEvent, CODE_INTERNAL};

/// Items carried by the token queue. `End` is the end-of-tokens sentinel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenFrame {
    Token(String),
    End,
}

/// Identifiers and limits shared by both pipeline tasks.
#[derive(Debug, Clone)]
pub(crate) struct PipelineContext {
    pub turn_id: String,
    pub session_id: String,
    pub interrupt_wait: Duration,
}

/// Terminal result of the producer task, applied to the turn record by the
/// processor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProducerOutcome {
    Completed { content: String },
    Failed { error: String },
    Cancelled,
}

/// Send an event to the client-bound queue, giving up on cancellation or a
/// closed queue. Returns `false` when the event was not delivered.
async fn send_event(
    event_tx: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
    event: ServerEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = event_tx.send(event) => sent.is_ok(),
    }
}

/// Producer task body: drain the agent stream into the per-turn queues.
pub(crate) async fn run_producer(
    ctx: PipelineContext,
    mut agent_stream: AgentStream,
    token_tx: mpsc::Sender<TokenFrame>,
    event_tx: mpsc::Sender<ServerEvent>,
    drained_rx: oneshot::Receiver<()>,
    flushed_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) -> ProducerOutcome {
    let mut barrier = Some((drained_rx, flushed_rx));
    let mut pending_tool_calls: VecDeque<(String, Instant)> = VecDeque::new();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(turn_id = %ctx.turn_id, "Producer cancelled");
                return ProducerOutcome::Cancelled;
            }
            item = agent_stream.next() => item,
        };

        match item {
            Some(Ok(AgentEvent::StreamStart { .. })) => {
                // Identifiers are rewritten to the ones this turn was
                // registered under, so clients always correlate on the
                // turn_id returned by StartTurn.
                let event = ServerEvent::StreamStart {
                    turn_id: ctx.turn_id.clone(),
                    session_id: ctx.session_id.clone(),
                };
                if !send_event(&event_tx, &cancel, event).await {
                    return ProducerOutcome::Cancelled;
                }
            }
            Some(Ok(AgentEvent::StreamToken { chunk, .. })) => {
                // Blocks when the token queue is full; this suspension is
                // what propagates backpressure up into the agent stream.
                let delivered = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = token_tx.send(TokenFrame::Token(chunk)) => sent.is_ok(),
                };
                if !delivered {
                    return ProducerOutcome::Cancelled;
                }
            }
            Some(Ok(AgentEvent::ToolCall {
                tool_name, args, ..
            })) => {
                info!(
                    turn_id = %ctx.turn_id,
                    session_id = %ctx.session_id,
                    tool_name = %tool_name,
                    args = %args,
                    status = "started",
                    "Agent tool call"
                );
                pending_tool_calls.push_back((tool_name, Instant::now()));
            }
            Some(Ok(AgentEvent::ToolResult { result, .. })) => {
                let (tool_name, started_at) = pending_tool_calls
                    .pop_front()
                    .unwrap_or_else(|| ("unknown".to_string(), Instant::now()));
                info!(
                    turn_id = %ctx.turn_id,
                    session_id = %ctx.session_id,
                    tool_name = %tool_name,
                    result = %result,
                    status = "completed",
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "Agent tool result"
                );
            }
            Some(Ok(AgentEvent::StreamEnd { content, .. })) => {
                wait_for_consumer(&ctx, &token_tx, barrier.take()).await;
                let event = ServerEvent::StreamEnd {
                    turn_id: ctx.turn_id.clone(),
                    session_id: ctx.session_id.clone(),
                    content: content.clone(),
                };
                if !send_event(&event_tx, &cancel, event).await {
                    return ProducerOutcome::Cancelled;
                }
                return ProducerOutcome::Completed { content };
            }
            Some(Err(error)) => {
                warn!(
                    turn_id = %ctx.turn_id,
                    session_id = %ctx.session_id,
                    error = %error,
                    "Agent stream raised an error"
                );
                wait_for_consumer(&ctx, &token_tx, barrier.take()).await;
                let event = ServerEvent::Error {
                    code: CODE_INTERNAL,
                    error: error.to_string(),
                };
                let _ = send_event(&event_tx, &cancel, event).await;
                return ProducerOutcome::Failed {
                    error: error.to_string(),
                };
            }
            None => {
                // The sequence contract promises a terminal event; a bare
                // close means the upstream died mid-turn.
                warn!(
                    turn_id = %ctx.turn_id,
                    "Agent stream closed without a terminal event"
                );
                wait_for_consumer(&ctx, &token_tx, barrier.take()).await;
                let event = ServerEvent::Error {
                    code: CODE_INTERNAL,
                    error: "agent stream ended without stream_end".to_string(),
                };
                let _ = send_event(&event_tx, &cancel, event).await;
                return ProducerOutcome::Failed {
                    error: "agent stream ended without stream_end".to_string(),
                };
            }
        }
    }
}

/// The two-phase end-of-stream barrier.
///
/// Phase 1 waits for the token queue to be fully drained (the consumer has
/// dequeued the sentinel, hence every token before it). Phase 2 waits for the
/// consumer task itself, whose last act before finishing is the post-drain
/// `finalize()` flush. Both phases are bounded so a wedged consumer cannot
/// stall the turn forever.
async fn wait_for_consumer(
    ctx: &PipelineContext,
    token_tx: &mpsc::Sender<TokenFrame>,
    barrier: Option<(oneshot::Receiver<()>, oneshot::Receiver<()>)>,
) {
    let _ = token_tx.send(TokenFrame::End).await;

    let Some((drained_rx, flushed_rx)) = barrier else {
        return;
    };

    if tokio::time::timeout(ctx.interrupt_wait, drained_rx)
        .await
        .is_err()
    {
        debug!(turn_id = %ctx.turn_id, "Timed out waiting for token queue drain");
    }
    if tokio::time::timeout(ctx.interrupt_wait, flushed_rx)
        .await
        .is_err()
    {
        debug!(turn_id = %ctx.turn_id, "Timed out waiting for consumer flush");
    }
}

/// Consumer task body: token queue in, normalized sentence chunks out.
pub(crate) async fn run_consumer(
    mut splitter: ChunkSplitter,
    normalizer: std::sync::Arc<TextNormalizer>,
    mut token_rx: mpsc::Receiver<TokenFrame>,
    event_tx: mpsc::Sender<ServerEvent>,
    drained_tx: oneshot::Sender<()>,
    flushed_tx: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut drained_tx = Some(drained_tx);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                // Cancellation discards whatever is buffered.
                return;
            }
            frame = token_rx.recv() => frame,
        };

        match frame {
            Some(TokenFrame::Token(chunk)) => {
                for sentence in splitter.feed(&chunk) {
                    if !emit_chunk(&normalizer, &sentence, &event_tx, &cancel).await {
                        return;
                    }
                }
            }
            Some(TokenFrame::End) => {
                // Phase 1 of the barrier: every token before the sentinel has
                // been consumed.
                if let Some(tx) = drained_tx.take() {
                    let _ = tx.send(());
                }
                for sentence in splitter.finalize() {
                    if !emit_chunk(&normalizer, &sentence, &event_tx, &cancel).await {
                        return;
                    }
                }
                // Phase 2: the flush is complete.
                let _ = flushed_tx.send(());
                return;
            }
            None => return,
        }
    }
}

/// Normalize one sentence and enqueue it when non-empty.
async fn emit_chunk(
    normalizer: &TextNormalizer,
    sentence: &str,
    event_tx: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
) -> bool {
    let Some(normalized) = normalizer.process(sentence) else {
        return true;
    };
    send_event(
        event_tx,
        cancel,
        ServerEvent::TtsReadyChunk {
            chunk: normalized.text,
            emotion: normalized.emotion,
        },
    )
    .await
}
