use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::VigilError;

/// Opaque task identifier, assigned when the task is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Final (or cancellation) result recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    /// The handler resolved the task successfully.
    Completed { value: Value },
    /// The task failed permanently.
    Failed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// The task was cancelled before reaching another terminal state.
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl TaskResult {
    pub fn status(&self) -> &'static str {
        match self {
            TaskResult::Completed { .. } => "completed",
            TaskResult::Failed { .. } => "failed",
            TaskResult::Cancelled { .. } => "cancelled",
        }
    }
}

/// What caused the most recent failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Explicit or implicit temporary failure reported by the handler.
    Temporary,
    /// The attempt exceeded its per-attempt timeout.
    Timeout,
    /// The handler raised the abort signal.
    Abort,
    /// The handler resolved the task as permanently failed.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Temporary => "temporary",
            FailureKind::Timeout => "timeout",
            FailureKind::Abort => "abort",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureKind {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(FailureKind::Temporary),
            "timeout" => Ok(FailureKind::Timeout),
            "abort" => Ok(FailureKind::Abort),
            "permanent" => Ok(FailureKind::Permanent),
            other => Err(VigilError::Serialization(format!(
                "unknown failure kind: {other}"
            ))),
        }
    }
}

/// Exclusive claim on a task held by one worker for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique token for this attempt; reports must present it.
    pub token: String,
    /// Identifier of the worker holding the lease.
    pub owner: String,
    /// Instant after which the lease is considered abandoned.
    pub expires: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            expires,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// Durable task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedTask {
    pub id: TaskId,
    /// Registered handler name, e.g. `"module:taskname"`.
    pub task_type: String,
    pub task_data: Value,
    pub created: DateTime<Utc>,
    /// Earliest instant an attempt may start.
    pub not_before: DateTime<Utc>,
    /// Next scheduled attempt; `None` once finished.
    pub next_attempt: Option<DateTime<Utc>>,
    pub failures: u32,
    pub last_errors: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Data snapshot recorded by the most recent temporary failure.
    pub last_data: Option<Value>,
    /// Set exactly once, when the task becomes terminal.
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// When cancellation was requested.
    pub cancelled: Option<DateTime<Utc>>,
    /// Per-attempt timeout.
    pub timeout_ms: Option<u64>,
    pub lease: Option<Lease>,
    /// Whether a side payload is stored for this task.
    pub has_auxdata: bool,
}

impl ManagedTask {
    /// Create a new pending task. `next_attempt` starts at `not_before`,
    /// which defaults to `now`.
    ///
    /// Both instants are truncated to whole milliseconds, the precision
    /// stores keep.
    pub fn new(
        task_type: impl Into<String>,
        task_data: Value,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> Self {
        let now = now.trunc_subsecs(3);
        let not_before = not_before.map_or(now, |at| at.trunc_subsecs(3));
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            task_data,
            created: now,
            not_before,
            next_attempt: Some(not_before),
            failures: 0,
            last_errors: None,
            failure_kind: None,
            last_data: None,
            finished: None,
            result: None,
            cancelled: None,
            timeout_ms: None,
            lease: None,
            has_auxdata: false,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_auxdata_flag(mut self, has_auxdata: bool) -> Self {
        self.has_auxdata = has_auxdata;
        self
    }
}

/// Filter for enumerating tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Filter by task type.
    pub task_type: Option<String>,
    /// Only tasks created strictly after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only tasks that are not finished.
    pub only_pending: bool,
    /// Maximum number of tasks to return.
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub fn only_pending(mut self, only_pending: bool) -> Self {
        self.only_pending = only_pending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Aggregate counts reported by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub pending: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub schema_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_defaults_not_before_to_now() {
        let now = Utc::now().trunc_subsecs(3);
        let task = ManagedTask::new("test:ping", json!({"ping": 1}), now, None);
        assert_eq!(task.not_before, now);
        assert_eq!(task.next_attempt, Some(now));
        assert!(task.finished.is_none());
        assert_eq!(task.failures, 0);
    }

    #[test]
    fn test_new_task_keeps_millisecond_precision() {
        let now = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let later = now + chrono::Duration::nanoseconds(5_000_999);
        let task = ManagedTask::new("test:ping", json!({}), now, Some(later));
        assert_eq!(task.created.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(task.not_before.timestamp_subsec_nanos(), 128_000_000);
        assert_eq!(task.next_attempt, Some(task.not_before));
    }

    #[test]
    fn test_task_result_tagging() {
        let result = TaskResult::Completed { value: json!(42) };
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded, json!({"status": "completed", "value": 42}));

        let cancelled: TaskResult = serde_json::from_value(json!({"status": "cancelled"})).unwrap();
        assert_eq!(cancelled, TaskResult::Cancelled { data: None });
    }

    #[test]
    fn test_failure_kind_parse() {
        for kind in [
            FailureKind::Temporary,
            FailureKind::Timeout,
            FailureKind::Abort,
            FailureKind::Permanent,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<FailureKind>().is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }
}
