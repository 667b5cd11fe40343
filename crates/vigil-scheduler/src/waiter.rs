//! Waiting for task results.
//!
//! A waiter subscribes to change notifications *before* reading the task,
//! then re-reads the store after every wake-up. Notifications are only
//! hints, so duplicated or racing deliveries cannot produce a stale or
//! doubled result.

use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;
use vigil_bus::TASKS_CHANGED;
use vigil_core::{observe, FailureKind, ManagedTask, TaskId, TaskResult};

/// Bound on how long [`Scheduler::retrieve_task_result`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitLimit {
    /// Relative to the start of the call.
    Duration(Duration),
    /// Absolute instant.
    Deadline(DateTime<Utc>),
}

/// Acceptance flags for [`Scheduler::retrieve_task_result`].
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub timeout: Option<WaitLimit>,
    /// Return `None` instead of waiting out a backoff window.
    pub accept_temp_failure: bool,
    /// Return `None` instead of failing when the wait runs out.
    pub accept_timeout: bool,
    /// Return the last data snapshot of a cancelled task instead of failing.
    pub accept_cancel: bool,
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(WaitLimit::Duration(timeout));
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.timeout = Some(WaitLimit::Deadline(deadline));
        self
    }

    pub fn accept_temp_failure(mut self) -> Self {
        self.accept_temp_failure = true;
        self
    }

    pub fn accept_timeout(mut self) -> Self {
        self.accept_timeout = true;
        self
    }

    pub fn accept_cancel(mut self) -> Self {
        self.accept_cancel = true;
        self
    }

    fn deadline_instant(&self) -> Option<tokio::time::Instant> {
        let now = tokio::time::Instant::now();
        match self.timeout? {
            WaitLimit::Duration(d) => Some(now + d),
            WaitLimit::Deadline(at) => {
                let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                Some(now + remaining)
            }
        }
    }
}

enum Verdict {
    Ready(Option<Value>),
    Waiting,
}

fn evaluate(task: &ManagedTask, opts: &RetrieveOptions, now: DateTime<Utc>) -> Result<Verdict> {
    let id = &task.id;

    match &task.result {
        Some(TaskResult::Completed { value }) => return Ok(Verdict::Ready(Some(value.clone()))),
        Some(TaskResult::Failed { error, .. }) => {
            if task.failure_kind == Some(FailureKind::Abort) {
                return Err(SchedulerError::TaskAborted {
                    id: id.clone(),
                    message: error.clone(),
                });
            }
            return Err(SchedulerError::PermanentlyFailed {
                id: id.clone(),
                error: error.clone(),
            });
        }
        Some(TaskResult::Cancelled { data }) => {
            if opts.accept_cancel {
                return Ok(Verdict::Ready(data.clone()));
            }
            return Err(SchedulerError::Cancelled(id.clone()));
        }
        None => {}
    }

    if !task.in_backoff(now) {
        return Ok(Verdict::Waiting);
    }

    let message = task.last_errors.clone().unwrap_or_default();
    match task.failure_kind {
        Some(FailureKind::Abort) => Err(SchedulerError::TaskAborted {
            id: id.clone(),
            message,
        }),
        _ if opts.accept_temp_failure => Ok(Verdict::Ready(None)),
        Some(FailureKind::Timeout) => Err(SchedulerError::AttemptFailed {
            id: id.clone(),
            message,
        }),
        _ => Ok(Verdict::Waiting),
    }
}

impl Scheduler {
    /// Wait for a task's result.
    ///
    /// Resolves with the completion value, or with `None` / the cancellation
    /// snapshot when `opts` accepts an early return. Raises on permanent
    /// failure, abort, attempt timeout, unaccepted cancellation and an
    /// exhausted wait.
    pub async fn retrieve_task_result(
        &self,
        id: &TaskId,
        opts: RetrieveOptions,
    ) -> Result<Option<Value>> {
        let started = Instant::now();
        let deadline = opts.deadline_instant();
        let wake = self.wake_strategy();
        let mut subscription = wake.subscribe(TASKS_CHANGED);

        loop {
            let task = self
                .store()
                .get_task(id)?
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;

            let verdict = evaluate(&task, &opts, Utc::now());
            if !matches!(verdict, Ok(Verdict::Waiting)) {
                observe::record_wait(started.elapsed());
            }
            if let Verdict::Ready(value) = verdict? {
                return Ok(value);
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                observe::record_wait(started.elapsed());
                debug!(task_id = %id, "Wait for task result timed out");
                if opts.accept_timeout {
                    return Ok(None);
                }
                return Err(SchedulerError::WaitTimeout {
                    id: id.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            wake.wait(&mut subscription, deadline).await;
        }
    }
}
