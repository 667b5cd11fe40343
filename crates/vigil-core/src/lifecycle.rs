//! Task lifecycle transitions.
//!
//! All state changes of a [`ManagedTask`] go through these methods so that the
//! record invariants hold no matter which store persists it:
//!
//! - a task is either pending with a `next_attempt`, or `finished`; never both
//! - `finished` is written once; terminal tasks reject further transitions
//! - `next_attempt` never precedes `not_before`
//! - retry scheduling uses the backoff of the current `failures` count

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backoff::backoff_delay;
use crate::error::{Result, VigilError};
use crate::types::{FailureKind, Lease, ManagedTask, TaskResult};

/// A retryable failure of one attempt.
#[derive(Debug, Clone)]
pub struct TemporaryFailure {
    pub message: String,
    pub kind: FailureKind,
    /// Data snapshot to record alongside the failure.
    pub data: Option<Value>,
    /// Explicit retry instant overriding the backoff table.
    pub next_retry: Option<DateTime<Utc>>,
}

impl TemporaryFailure {
    pub fn new(message: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            message: message.into(),
            kind,
            data: None,
            next_retry: None,
        }
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_next_retry(mut self, next_retry: Option<DateTime<Utc>>) -> Self {
        self.next_retry = next_retry;
        self
    }
}

/// What a temporary failure did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued for another attempt at the given instant.
    Rescheduled(DateTime<Utc>),
    /// `max_failures` was reached; the task is now permanently failed.
    Escalated,
    /// A cancellation was pending; the task is now cancelled.
    Cancelled,
}

/// What a cancellation request did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// The task was already terminal; nothing changed.
    AlreadyFinished,
    /// The task was idle and is now cancelled.
    Cancelled,
    /// An attempt is in flight; the worker must acknowledge the abort.
    AwaitingAck,
}

impl ManagedTask {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Whether an attempt currently holds a live lease.
    pub fn is_executing(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.lease.as_ref().is_some_and(|l| l.is_live(now))
    }

    /// Whether a worker may claim the task now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished()
            && !self.is_executing(now)
            && self.next_attempt.is_some_and(|at| at <= now)
    }

    /// Pending, idle, failed at least once and waiting for its next attempt.
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished()
            && !self.is_executing(now)
            && self.failures > 0
            && self.next_attempt.is_some_and(|at| at > now)
    }

    pub fn holds_lease(&self, token: &str) -> bool {
        self.lease.as_ref().is_some_and(|l| l.token == token)
    }

    /// Take the exclusive lease for a new attempt. Returns `false` when the
    /// task is not eligible (finished, not yet due, or leased by someone else).
    pub fn try_claim(&mut self, lease: Lease, now: DateTime<Utc>) -> bool {
        if !self.is_eligible(now) {
            return false;
        }
        self.lease = Some(lease);
        true
    }

    /// Extend the lease held under `token`.
    pub fn renew_lease(&mut self, token: &str, expires: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        match self.lease.as_mut() {
            Some(lease) if lease.token == token => {
                lease.expires = expires;
                true
            }
            _ => false,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>, value: Value) -> Result<()> {
        self.ensure_pending("complete")?;
        self.finish(now, TaskResult::Completed { value });
        Ok(())
    }

    pub fn fail_temporarily(
        &mut self,
        now: DateTime<Utc>,
        failure: TemporaryFailure,
        max_failures: Option<u32>,
    ) -> Result<FailureDisposition> {
        self.ensure_pending("fail temporarily")?;

        self.failures = self.failures.saturating_add(1);
        self.last_errors = Some(failure.message.clone());
        self.failure_kind = Some(failure.kind);
        if failure.data.is_some() {
            self.last_data = failure.data.clone();
        }

        if self.cancelled.is_some() {
            self.finish_cancelled(now)?;
            return Ok(FailureDisposition::Cancelled);
        }

        if max_failures.is_some_and(|max| self.failures >= max) {
            self.finish(
                now,
                TaskResult::Failed {
                    error: failure.message,
                    data: failure.data,
                },
            );
            return Ok(FailureDisposition::Escalated);
        }

        let scheduled = failure
            .next_retry
            .unwrap_or_else(|| now + backoff_delay(self.failures));
        let next = scheduled.max(self.not_before);
        self.next_attempt = Some(next);
        self.lease = None;
        Ok(FailureDisposition::Rescheduled(next))
    }

    pub fn fail_permanently(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<()> {
        self.ensure_pending("fail permanently")?;
        let message = message.into();
        self.failures = self.failures.saturating_add(1);
        self.last_errors = Some(message.clone());
        self.failure_kind = Some(FailureKind::Permanent);
        self.finish(
            now,
            TaskResult::Failed {
                error: message,
                data,
            },
        );
        Ok(())
    }

    /// Record a cancellation request. Idle tasks are cancelled immediately;
    /// executing ones wait for their worker.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelDisposition {
        if self.is_finished() {
            return CancelDisposition::AlreadyFinished;
        }
        self.cancelled.get_or_insert(now);
        if self.is_executing(now) {
            return CancelDisposition::AwaitingAck;
        }
        self.finish(
            now,
            TaskResult::Cancelled {
                data: self.last_data.clone(),
            },
        );
        CancelDisposition::Cancelled
    }

    /// Terminal cancellation, written once the in-flight attempt is gone.
    pub fn finish_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending("cancel")?;
        self.cancelled.get_or_insert(now);
        self.finish(
            now,
            TaskResult::Cancelled {
                data: self.last_data.clone(),
            },
        );
        Ok(())
    }

    /// Make the task eligible again: `next_attempt` becomes `not_before`,
    /// or `now` when `not_before` has passed. Returns `false` for finished
    /// tasks, which never transition again.
    pub fn retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.next_attempt = Some(self.not_before.max(now));
        true
    }

    fn finish(&mut self, now: DateTime<Utc>, result: TaskResult) {
        self.finished = Some(now);
        self.next_attempt = None;
        self.lease = None;
        self.result = Some(result);
    }

    fn ensure_pending(&self, action: &str) -> Result<()> {
        if self.is_finished() {
            return Err(VigilError::InvalidState(format!(
                "cannot {action} task {}: already finished",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn pending(now: DateTime<Utc>) -> ManagedTask {
        ManagedTask::new("test:task", json!({}), now, None)
    }

    fn assert_invariant(task: &ManagedTask) {
        assert!(
            task.finished.is_some() ^ task.next_attempt.is_some(),
            "task must be either pending with next_attempt or finished: {task:?}"
        );
        if let Some(next) = task.next_attempt {
            assert!(next >= task.not_before);
        }
    }

    #[test]
    fn test_claim_requires_eligibility() {
        let now = Utc::now();
        let mut task = ManagedTask::new("t", json!({}), now, Some(now + Duration::minutes(5)));
        assert!(!task.try_claim(Lease::new("w1", now + Duration::minutes(1)), now));

        let mut task2 = pending(now);
        assert!(task2.try_claim(Lease::new("w1", now + Duration::minutes(1)), now));
        // A second worker cannot claim while the lease is live
        assert!(!task2.try_claim(Lease::new("w2", now + Duration::minutes(1)), now));
        // But can once it expires
        let later = now + Duration::minutes(2);
        assert!(task2.try_claim(Lease::new("w2", later + Duration::minutes(1)), later));
        assert_eq!(task2.lease.as_ref().unwrap().owner, "w2");
    }

    #[test]
    fn test_temporary_failure_uses_backoff() {
        let now = Utc::now();
        let mut task = pending(now);
        let disposition = task
            .fail_temporarily(now, TemporaryFailure::new("boom", FailureKind::Temporary), None)
            .unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::Rescheduled(now + Duration::minutes(15))
        );
        assert_eq!(task.failures, 1);
        assert_eq!(task.last_errors.as_deref(), Some("boom"));

        task.fail_temporarily(now, TemporaryFailure::new("boom", FailureKind::Temporary), None)
            .unwrap();
        assert_eq!(task.next_attempt, Some(now + Duration::minutes(30)));
        assert!(task.in_backoff(now));
        assert_invariant(&task);
    }

    #[test]
    fn test_explicit_next_retry_is_lower_bounded_by_not_before() {
        let now = Utc::now();
        let not_before = now + Duration::hours(2);
        let mut task = ManagedTask::new("t", json!({}), now, Some(not_before));
        let failure = TemporaryFailure::new("later", FailureKind::Temporary)
            .with_next_retry(Some(now + Duration::minutes(1)));
        task.fail_temporarily(now, failure, None).unwrap();
        assert_eq!(task.next_attempt, Some(task.not_before));
        assert!(task.not_before > now + Duration::minutes(119));
    }

    #[test]
    fn test_max_failures_escalates() {
        let now = Utc::now();
        let mut task = pending(now);
        task.fail_temporarily(now, TemporaryFailure::new("a", FailureKind::Abort), Some(2))
            .unwrap();
        assert!(!task.is_finished());
        let disposition = task
            .fail_temporarily(now, TemporaryFailure::new("b", FailureKind::Abort), Some(2))
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Escalated);
        assert_eq!(task.failures, 2);
        assert!(matches!(task.result, Some(TaskResult::Failed { ref error, .. }) if error == "b"));
        assert_invariant(&task);
    }

    #[test]
    fn test_finished_is_write_once() {
        let now = Utc::now();
        let mut task = pending(now);
        task.complete(now, json!(1)).unwrap();
        assert!(task.complete(now, json!(2)).is_err());
        assert!(task.fail_permanently(now, "late", None).is_err());
        assert!(task
            .fail_temporarily(now, TemporaryFailure::new("late", FailureKind::Temporary), None)
            .is_err());
        assert!(!task.retry(now));
        assert_eq!(task.request_cancel(now), CancelDisposition::AlreadyFinished);
        assert_eq!(task.result, Some(TaskResult::Completed { value: json!(1) }));
        assert_invariant(&task);
    }

    #[test]
    fn test_permanent_failure_counts() {
        let now = Utc::now();
        let mut task = pending(now);
        task.fail_permanently(now, "nope", Some(json!({"x": 1}))).unwrap();
        assert_eq!(task.failures, 1);
        assert_eq!(task.failure_kind, Some(FailureKind::Permanent));
        assert_invariant(&task);
    }

    #[test]
    fn test_cancel_idle_task_is_immediate() {
        let now = Utc::now();
        let mut task = pending(now);
        task.fail_temporarily(
            now,
            TemporaryFailure::new("x", FailureKind::Temporary).with_data(Some(json!({"step": 3}))),
            None,
        )
        .unwrap();
        assert_eq!(task.request_cancel(now), CancelDisposition::Cancelled);
        assert_eq!(
            task.result,
            Some(TaskResult::Cancelled {
                data: Some(json!({"step": 3}))
            })
        );
        assert_invariant(&task);
    }

    #[test]
    fn test_cancel_executing_task_waits_for_ack() {
        let now = Utc::now();
        let mut task = pending(now);
        assert!(task.try_claim(Lease::new("w", now + Duration::minutes(1)), now));
        assert_eq!(task.request_cancel(now), CancelDisposition::AwaitingAck);
        assert!(!task.is_finished());
        assert!(task.cancelled.is_some());

        // The attempt then reports a temporary failure; the pending cancel wins
        let disposition = task
            .fail_temporarily(now, TemporaryFailure::new("aborted", FailureKind::Abort), None)
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Cancelled);
        assert!(matches!(task.result, Some(TaskResult::Cancelled { .. })));
        assert_invariant(&task);
    }

    #[test]
    fn test_retry_clamps_to_now_or_not_before() {
        let now = Utc::now();
        let mut task = pending(now);
        task.fail_temporarily(now, TemporaryFailure::new("x", FailureKind::Temporary), None)
            .unwrap();
        let later = now + Duration::seconds(5);
        assert!(task.retry(later));
        assert_eq!(task.next_attempt, Some(later));
        // Idempotent on an already-eligible task
        assert!(task.retry(later));
        assert_eq!(task.next_attempt, Some(later));

        let not_before = now + Duration::hours(1);
        let mut delayed = ManagedTask::new("t", json!({}), now, Some(not_before));
        assert!(delayed.retry(now));
        assert_eq!(delayed.next_attempt, Some(delayed.not_before));
    }

    #[test]
    fn test_renew_lease_checks_token() {
        let now = Utc::now();
        let mut task = pending(now);
        let lease = Lease::new("w", now + Duration::seconds(10));
        let token = lease.token.clone();
        assert!(task.try_claim(lease, now));
        assert!(!task.renew_lease("other", now + Duration::minutes(5)));
        assert!(task.renew_lease(&token, now + Duration::minutes(5)));
        assert_eq!(task.lease.unwrap().expires, now + Duration::minutes(5));
    }
}
