use crate::error::Result;
use crate::types::{ManagedTask, StoreStats, TaskFilter, TaskId};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Transaction over the task table
///
/// Every mutation of task records happens inside one of these. Changes
/// become visible to other readers only after `commit`. Dropping an
/// uncommitted transaction rolls it back.
///
/// Note: Not required to be Send, as some backends hold thread-affine guards
pub trait TaskTxn {
    /// Insert a new task record, with its optional side payload
    fn insert_task(&mut self, task: &ManagedTask, auxdata: Option<&Value>) -> Result<()>;

    /// Load a task for modification within this transaction
    fn load_task(&mut self, id: &TaskId) -> Result<Option<ManagedTask>>;

    /// Persist a modified task record
    fn update_task(&mut self, task: &ManagedTask) -> Result<()>;

    /// Ids of all unfinished tasks of a given type
    fn pending_ids_by_type(&mut self, task_type: &str) -> Result<Vec<TaskId>>;

    /// Commit transaction
    fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback transaction
    fn rollback(self: Box<Self>);
}

/// Durable store of record for managed tasks
///
/// Reads outside a transaction always observe committed state.
pub trait TaskStore: Send + Sync {
    /// Begin a write transaction
    fn begin(&self) -> Result<Box<dyn TaskTxn + '_>>;

    /// Read a committed task snapshot
    fn get_task(&self, id: &TaskId) -> Result<Option<ManagedTask>>;

    /// Enumerate tasks, newest first
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ManagedTask>>;

    /// Candidate tasks of the given types that are due and not held by a
    /// live lease, oldest `next_attempt` first. Candidates still have to be
    /// claimed.
    fn due_tasks(
        &self,
        now: DateTime<Utc>,
        task_types: &[String],
        limit: usize,
    ) -> Result<Vec<TaskId>>;

    /// Earliest instant a pending task of the given types becomes
    /// claimable (its `next_attempt`, or its lease expiry if later)
    fn next_wake_time(&self, task_types: &[String]) -> Result<Option<DateTime<Utc>>>;

    /// Load a task's side payload
    fn load_auxdata(&self, id: &TaskId) -> Result<Option<Value>>;

    /// Delete tasks that finished before `before`; returns how many
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Aggregate counts for status reporting
    fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats>;

    /// Get the schema version
    fn schema_version(&self) -> Result<u32>;
}
