//! Waiting for cancellations to take effect.

use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use std::time::Duration;
use tracing::debug;
use vigil_bus::TASKS_CHANGED;
use vigil_core::TaskId;

/// Returned by [`Work::cancel_tasks`](crate::Work::cancel_tasks).
///
/// Tasks that were idle are already cancelled when the work commits. Tasks
/// that were executing are only done once their worker has signalled the
/// handler, seen the channel close and reported the attempt.
pub struct CancelHandle {
    scheduler: Scheduler,
    requested: Vec<TaskId>,
    awaiting_ack: Vec<TaskId>,
    already_finished: Vec<TaskId>,
}

impl CancelHandle {
    pub(crate) fn new(
        scheduler: Scheduler,
        requested: Vec<TaskId>,
        awaiting_ack: Vec<TaskId>,
        already_finished: Vec<TaskId>,
    ) -> Self {
        Self {
            scheduler,
            requested,
            awaiting_ack,
            already_finished,
        }
    }

    /// Every task the cancellation was requested for.
    pub fn requested(&self) -> &[TaskId] {
        &self.requested
    }

    /// Tasks that were executing when cancellation was requested.
    pub fn awaiting_ack(&self) -> &[TaskId] {
        &self.awaiting_ack
    }

    /// Tasks that were already terminal; the request left them unchanged.
    pub fn already_finished(&self) -> &[TaskId] {
        &self.already_finished
    }

    /// Tasks that were idle and are cancelled by this request.
    pub fn cancelled_now(&self) -> Vec<TaskId> {
        self.requested
            .iter()
            .filter(|id| !self.awaiting_ack.contains(id) && !self.already_finished.contains(id))
            .cloned()
            .collect()
    }

    /// Whether every cancellation took effect within the transaction.
    pub fn is_immediate(&self) -> bool {
        self.awaiting_ack.is_empty()
    }

    /// Wait until every task that was executing has become terminal.
    ///
    /// Call after the work that produced this handle has committed. Without
    /// a `timeout` this waits as long as it takes.
    pub async fn tasks_cancelled(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_immediate() {
            return Ok(());
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let wake = self.scheduler.wake_strategy();
        let mut subscription = wake.subscribe(TASKS_CHANGED);

        loop {
            let pending = self.still_running()?;
            if pending == 0 {
                debug!(tasks = self.awaiting_ack.len(), "Cancellation acknowledged");
                return Ok(());
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(SchedulerError::CancelTimeout { pending });
            }

            wake.wait(&mut subscription, deadline).await;
        }
    }

    fn still_running(&self) -> Result<usize> {
        let mut pending = 0;
        for id in &self.awaiting_ack {
            match self.scheduler.store().get_task(id)? {
                Some(task) if !task.is_finished() => pending += 1,
                _ => {}
            }
        }
        Ok(pending)
    }
}
