//! The agent engine seam.
//!
//! The gateway never talks to a concrete model runtime; it consumes a finite,
//! non-restartable event stream produced by whatever [`AgentHandle`]
//! implementation the application injects. The stream is the
//! channel-closed-on-end pattern: a bounded receiver paired with a
//! cancellation token that fires when the reader is dropped, so cancelling
//! the reader stops further upstream work.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events yielded by an agent stream.
///
/// Exactly one `StreamStart` and at most one `StreamEnd` per sequence; errors
/// are raised through the stream item type instead.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StreamStart {
        turn_id: String,
        session_id: String,
    },
    StreamToken {
        chunk: String,
        node: Option<String>,
    },
    ToolCall {
        tool_name: String,
        args: String,
        node: Option<String>,
    },
    ToolResult {
        result: String,
        node: Option<String>,
    },
    StreamEnd {
        turn_id: String,
        session_id: String,
        content: String,
    },
}

/// Everything an engine needs to produce one response turn.
#[derive(Debug, Clone)]
pub struct AgentStreamRequest {
    pub content: String,
    pub user_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub persona: Option<String>,
    pub images: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Reader half of an agent event stream. Dropping it cancels the producer.
pub struct AgentStream {
    events: mpsc::Receiver<anyhow::Result<AgentEvent>>,
    cancel: CancellationToken,
}

/// Writer half handed to engine implementations.
#[derive(Clone)]
pub struct AgentSink {
    tx: mpsc::Sender<anyhow::Result<AgentEvent>>,
    cancel: CancellationToken,
}

impl AgentStream {
    /// Create a connected sink/stream pair with the given buffer capacity.
    pub fn channel(capacity: usize) -> (AgentSink, AgentStream) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            AgentSink {
                tx,
                cancel: cancel.clone(),
            },
            AgentStream { events: rx, cancel },
        )
    }

    /// Build a stream that replays a fixed script of events. Useful as a
    /// canned fallback and for exercising the pipeline in tests.
    pub fn scripted(events: Vec<anyhow::Result<AgentEvent>>) -> AgentStream {
        let (sink, stream) = AgentStream::channel(events.len().max(1));
        tokio::spawn(async move {
            for event in events {
                if sink.tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        stream
    }

    /// Receive the next event. `None` means the sequence is complete.
    pub async fn next(&mut self) -> Option<anyhow::Result<AgentEvent>> {
        self.events.recv().await
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AgentSink {
    /// Emit an event. Returns `false` when the reader is gone, which the
    /// engine must treat as a stop signal.
    pub async fn send(&self, event: AgentEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(event)) => sent.is_ok(),
        }
    }

    /// Raise an error through the stream, terminating the sequence.
    pub async fn fail(&self, error: anyhow::Error) -> bool {
        self.tx.send(Err(error)).await.is_ok()
    }

    /// Whether the reader has been dropped or cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the reader cancels the stream.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Narrow interface to the agent engine.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Start one response turn and return its event stream.
    async fn stream(&self, request: AgentStreamRequest) -> anyhow::Result<AgentStream>;
}
