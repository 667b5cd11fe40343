//! Transaction bracket for mutating calls.

use crate::cancellation::CancelHandle;
use crate::error::{Result, SchedulerError};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use vigil_bus::TASKS_CHANGED;
use vigil_core::{CancelDisposition, ManagedTask, TaskId, TaskTxn};

/// Options for [`Work::schedule_task`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Earliest instant the first attempt may start. Kept to whole
    /// milliseconds; finer precision is truncated.
    pub not_before: Option<DateTime<Utc>>,
    /// Per-attempt timeout, overriding the handler's default.
    pub timeout: Option<Duration>,
    /// Large side payload, stored apart from the task record.
    pub auxdata: Option<Value>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn auxdata(mut self, auxdata: Value) -> Self {
        self.auxdata = Some(auxdata);
        self
    }
}

/// Which tasks [`Work::retry_task`] applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTarget {
    /// A single task.
    Id(TaskId),
    /// Every unfinished task of a type.
    Type(String),
}

impl From<TaskId> for RetryTarget {
    fn from(id: TaskId) -> Self {
        RetryTarget::Id(id)
    }
}

impl From<&TaskId> for RetryTarget {
    fn from(id: &TaskId) -> Self {
        RetryTarget::Id(id.clone())
    }
}

/// An open store transaction used to schedule, retry and cancel tasks.
///
/// Changes become visible, and workers are notified, on [`Work::commit`].
/// Dropping a `Work` without committing rolls everything back.
pub struct Work<'a> {
    scheduler: &'a Scheduler,
    txn: Box<dyn TaskTxn + 'a>,
    modified: bool,
}

impl<'a> Work<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, txn: Box<dyn TaskTxn + 'a>) -> Self {
        Self {
            scheduler,
            txn,
            modified: false,
        }
    }

    /// Create a task. It becomes claimable once this work is committed and
    /// `not_before` has passed.
    pub fn schedule_task(
        &mut self,
        task_type: &str,
        task_data: Value,
        options: ScheduleOptions,
    ) -> Result<TaskId> {
        self.scheduler.handlers().get(task_type)?;

        let task = ManagedTask::new(task_type, task_data, Utc::now(), options.not_before)
            .with_timeout_ms(options.timeout.map(|t| t.as_millis() as u64))
            .with_auxdata_flag(options.auxdata.is_some());

        self.txn.insert_task(&task, options.auxdata.as_ref())?;
        self.modified = true;

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            not_before = %task.not_before,
            "Scheduled task"
        );
        Ok(task.id)
    }

    /// Make tasks eligible again right away (or at their `not_before`, if
    /// still in the future). The failure count is kept. Finished tasks are
    /// left alone. Returns how many tasks were rescheduled.
    pub fn retry_task(&mut self, target: impl Into<RetryTarget>) -> Result<usize> {
        let ids = match target.into() {
            RetryTarget::Id(id) => vec![id],
            RetryTarget::Type(task_type) => self.txn.pending_ids_by_type(&task_type)?,
        };

        let now = Utc::now();
        let mut retried = 0;
        for id in ids {
            let mut task = self
                .txn
                .load_task(&id)?
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;

            if task.retry(now) {
                self.txn.update_task(&task)?;
                retried += 1;
                debug!(task_id = %id, failures = task.failures, "Retrying task");
            } else {
                debug!(task_id = %id, "Ignoring retry of finished task");
            }
        }

        if retried > 0 {
            self.modified = true;
        }
        Ok(retried)
    }

    /// Request cancellation of `ids`.
    ///
    /// Idle tasks are cancelled within this transaction. Executing tasks are
    /// flagged; their workers signal the handlers once this work commits.
    /// The returned handle resolves when all of them are terminal.
    pub fn cancel_tasks(&mut self, ids: &[TaskId]) -> Result<CancelHandle> {
        let now = Utc::now();
        let mut awaiting_ack = Vec::new();
        let mut already_finished = Vec::new();

        for id in ids {
            let mut task = self
                .txn
                .load_task(id)?
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;

            match task.request_cancel(now) {
                CancelDisposition::AlreadyFinished => {
                    debug!(task_id = %id, "Task already finished, nothing to cancel");
                    already_finished.push(id.clone());
                }
                CancelDisposition::Cancelled => {
                    self.txn.update_task(&task)?;
                    self.modified = true;
                    info!(task_id = %id, "Cancelled task");
                }
                CancelDisposition::AwaitingAck => {
                    self.txn.update_task(&task)?;
                    self.modified = true;
                    awaiting_ack.push(id.clone());
                    info!(task_id = %id, "Cancellation requested for executing task");
                }
            }
        }

        Ok(CancelHandle::new(
            self.scheduler.clone(),
            ids.to_vec(),
            awaiting_ack,
            already_finished,
        ))
    }

    /// Commit, then notify workers and waiters if anything changed.
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        if self.modified {
            self.scheduler.bus().publish(TASKS_CHANGED);
        }
        Ok(())
    }

    /// Discard every change made through this work.
    pub fn rollback(self) {
        self.txn.rollback();
    }
}
