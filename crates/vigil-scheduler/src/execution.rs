//! Task execution logic.

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::task_handler::{AttemptOutcome, RegisteredHandler, TaskChannel, TaskContext, TaskResolution};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vigil_bus::TASKS_CHANGED;
use vigil_core::{observe, FailureDisposition, FailureKind, ManagedTask, TemporaryFailure};

/// A task this worker holds the lease for.
pub(crate) struct Claim {
    /// Snapshot taken when the claim committed.
    pub task: ManagedTask,
    pub token: String,
    pub lease_len: Duration,
    pub timeout: Option<Duration>,
    pub handler: RegisteredHandler,
}

impl Claim {
    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.task.failures + 1
    }
}

/// Execute a single claimed attempt and report its outcome.
pub(crate) async fn execute_attempt(
    scheduler: Scheduler,
    claim: Claim,
    channel: Option<TaskChannel>,
) -> Result<()> {
    let task_id = claim.task.id.clone();

    debug!(
        task_id = %task_id,
        task_type = %claim.task.task_type,
        attempt = claim.attempt(),
        hosting = claim.handler.runner.kind().as_str(),
        "Starting task attempt"
    );

    let auxdata = if claim.task.has_auxdata {
        scheduler.store().load_auxdata(&task_id)
    } else {
        Ok(None)
    };

    let started = Instant::now();
    let outcome = match auxdata {
        Ok(auxdata) => {
            let mut ctx = TaskContext::new(
                task_id.clone(),
                claim.task.task_type.clone(),
                claim.task.task_data.clone(),
                claim.attempt(),
                scheduler.locks().clone(),
            )
            .with_auxdata(auxdata);
            if let Some(channel) = channel {
                ctx = ctx.with_channel(channel);
            }
            claim.handler.runner.run(ctx, claim.timeout).await
        }
        Err(e) => AttemptOutcome::Failed {
            message: format!("Failed to load auxdata: {e}"),
            kind: FailureKind::Temporary,
        },
    };
    observe::record_attempt(started.elapsed(), outcome.label());

    if report_outcome(&scheduler, &claim, outcome)? {
        scheduler.bus().publish(TASKS_CHANGED);
    }
    Ok(())
}

/// Write the outcome of an attempt, guarded by the lease token.
///
/// Returns `false` when the report was discarded because this worker no
/// longer holds the lease.
pub(crate) fn report_outcome(
    scheduler: &Scheduler,
    claim: &Claim,
    outcome: AttemptOutcome,
) -> Result<bool> {
    let task_id = &claim.task.id;
    let mut txn = scheduler.store().begin()?;

    let Some(mut task) = txn.load_task(task_id)? else {
        warn!(task_id = %task_id, "Task disappeared before its outcome was reported");
        return Ok(false);
    };

    if !task.holds_lease(&claim.token) {
        warn!(
            task_id = %task_id,
            outcome = outcome.label(),
            "Discarding outcome of attempt that lost its lease"
        );
        return Ok(false);
    }

    let now = Utc::now();
    let max_failures = claim.handler.options.max_failures;

    let failure = match outcome {
        AttemptOutcome::Resolved(TaskResolution::Completed(value)) => {
            task.complete(now, value)?;
            info!(task_id = %task_id, task_type = %task.task_type, "Task completed");
            None
        }
        AttemptOutcome::Resolved(TaskResolution::PermanentFailure { message, data }) => {
            warn!(task_id = %task_id, error = %message, "Task failed permanently");
            task.fail_permanently(now, message, data)?;
            None
        }
        AttemptOutcome::Resolved(TaskResolution::TemporaryFailure {
            message,
            data,
            next_retry,
        }) => Some(
            TemporaryFailure::new(message, FailureKind::Temporary)
                .with_data(data)
                .with_next_retry(next_retry),
        ),
        AttemptOutcome::Failed { message, kind } => Some(TemporaryFailure::new(message, kind)),
    };

    if let Some(failure) = failure {
        let kind = failure.kind;
        match task.fail_temporarily(now, failure, max_failures)? {
            FailureDisposition::Rescheduled(next_attempt) => info!(
                task_id = %task_id,
                failures = task.failures,
                kind = kind.as_str(),
                next_attempt = %next_attempt,
                error = task.last_errors.as_deref().unwrap_or_default(),
                "Task failed, rescheduled"
            ),
            FailureDisposition::Escalated => warn!(
                task_id = %task_id,
                failures = task.failures,
                kind = kind.as_str(),
                "Task reached its failure limit, failed permanently"
            ),
            FailureDisposition::Cancelled => {
                info!(task_id = %task_id, "Task cancelled after its attempt stopped")
            }
        }
    }

    txn.update_task(&task)?;
    txn.commit()?;
    Ok(true)
}
