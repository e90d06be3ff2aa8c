//! Per-turn bookkeeping owned by the message processor.

use std::time::Instant;

use tokio::sync::mpsc;

use crate::protocol::ServerEvent;
use crate::supervisor::TaskSupervisor;

/// Lifecycle of a conversation turn. Transitions are monotonic: a terminal
/// status never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Completed | TurnStatus::Interrupted | TurnStatus::Failed
        )
    }

    /// Whether moving to `next` respects the forward-only ordering.
    fn allows(&self, next: TurnStatus) -> bool {
        match self {
            TurnStatus::Pending => next != TurnStatus::Pending,
            TurnStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// One conversation turn: status, queues, owned tasks, timestamps.
pub(crate) struct TurnState {
    pub turn_id: String,
    pub session_id: String,
    pub user_input: String,
    pub status: TurnStatus,
    pub created_at: Instant,
    pub finished_at: Option<Instant>,
    pub aggregate_content: String,
    /// Sender side of the client-bound event queue, kept so the processor can
    /// emit a final `interrupted` event. Dropped on every terminal path so the
    /// queue closes once the pipeline tasks are gone.
    pub event_tx: Option<mpsc::Sender<ServerEvent>>,
    /// Receiver side, handed out exactly once by `stream_events`.
    pub event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Supervisor owning the producer and consumer tasks.
    pub supervisor: TaskSupervisor,
}

impl TurnState {
    pub fn new(
        turn_id: String,
        session_id: String,
        user_input: String,
        event_tx: mpsc::Sender<ServerEvent>,
        event_rx: mpsc::Receiver<ServerEvent>,
        supervisor: TaskSupervisor,
    ) -> Self {
        Self {
            turn_id,
            session_id,
            user_input,
            status: TurnStatus::Pending,
            created_at: Instant::now(),
            finished_at: None,
            aggregate_content: String::new(),
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
            supervisor,
        }
    }

    /// Advance the status, enforcing monotonicity. Records `finished_at` on
    /// entry to a terminal status. Returns `false` when the transition is not
    /// allowed (already terminal, or moving backwards).
    pub fn advance(&mut self, next: TurnStatus) -> bool {
        if !self.status.allows(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
            self.event_tx = None;
        }
        true
    }

    /// Age of the terminal record, `None` while the turn is live.
    pub fn finished_age(&self) -> Option<std::time::Duration> {
        self.finished_at.map(|at| at.elapsed())
    }
}
