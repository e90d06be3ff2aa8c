//! Background-task supervision with bounded cancellation.
//!
//! Every task spawned on behalf of a turn is registered here. Cancellation is
//! cooperative: tasks observe the shared [`CancellationToken`] at their next
//! suspension point. Tasks that outlive the bounded wait are forcibly aborted
//! and logged; the caller never blocks indefinitely.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Owns the background tasks of one turn.
#[derive(Default)]
pub struct TaskSupervisor {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the supervised tasks select on for cooperative cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record a spawned task for lifecycle tracking.
    pub fn register(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Request cancellation and wait up to `wait` per task for it to finish.
    ///
    /// Tasks still running after the wait are aborted. Returns `true` when
    /// every task reached a terminal state cooperatively, `false` when at
    /// least one had to be forced.
    pub async fn cancel_and_wait(&mut self, wait: Duration) -> bool {
        self.cancel.cancel();
        self.join_all(wait).await
    }

    /// Wait for naturally-finishing tasks without requesting cancellation,
    /// aborting stragglers after the bounded wait. Used when a turn reached a
    /// terminal state on its own and its record is being removed.
    pub async fn join_all(&mut self, wait: Duration) -> bool {
        let mut all_cooperative = true;
        for mut handle in self.tasks.drain(..) {
            if handle.is_finished() {
                let _ = handle.await;
                continue;
            }
            match tokio::time::timeout(wait, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    all_cooperative = false;
                    warn!("Task did not stop within the bounded wait; forcing abort");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        all_cooperative
    }
}
