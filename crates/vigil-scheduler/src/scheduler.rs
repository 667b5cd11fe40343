//! Main scheduler implementation.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::task_handler::{
    BlockingTaskHandler, HandlerOptions, HandlerRegistry, TaskHandler, TaskRunner,
};
use crate::work::Work;
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vigil_bus::{ChangeBus, LocalChangeBus, PollingBus, WakeStrategy};
use vigil_core::{
    FailureKind, LockManager, ManagedTask, StoreStats, TaskFilter, TaskId, TaskResult, TaskStore,
};

/// Runtime context shared by the scheduling API, workers and waiters.
///
/// Everything a worker needs (store, bus, handler registry, named mutexes)
/// is held here and passed explicitly; there is no process-wide registry.
/// Cloning is cheap and shares the same context.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn ChangeBus>,
    wake: WakeStrategy,
    handlers: Arc<HandlerRegistry>,
    locks: Arc<LockManager>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler builder.
    pub fn builder(store: Arc<dyn TaskStore>) -> SchedulerBuilder {
        SchedulerBuilder::new(store)
    }

    /// Open a transaction for scheduling, retrying or cancelling tasks.
    ///
    /// Nothing done through the returned [`Work`] is visible to workers or
    /// waiters until [`Work::commit`].
    pub fn begin_work(&self) -> Result<Work<'_>> {
        let txn = self.store.begin()?;
        Ok(Work::new(self, txn))
    }

    /// Create a worker that executes tasks with this scheduler's handlers.
    pub fn worker(&self) -> Worker {
        Worker::new(self.clone())
    }

    /// Read-only snapshot of a task.
    pub fn describe_task(&self, id: &TaskId) -> Result<TaskDescription> {
        let task = self
            .store
            .get_task(id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        Ok(TaskDescription::from_task(&task, Utc::now()))
    }

    /// List tasks, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDescription>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_tasks(filter)?
            .iter()
            .map(|task| TaskDescription::from_task(task, now))
            .collect())
    }

    /// Side payload given when the task was scheduled.
    pub fn task_auxdata(&self, id: &TaskId) -> Result<Option<Value>> {
        if self.store.get_task(id)?.is_none() {
            return Err(SchedulerError::TaskNotFound(id.clone()));
        }
        Ok(self.store.load_auxdata(id)?)
    }

    /// Delete tasks that became terminal more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| SchedulerError::Other(format!("invalid retention: {e}")))?;
        let removed = self.store.purge_finished(Utc::now() - older_than)?;
        info!(removed, "Purged finished tasks");
        Ok(removed)
    }

    /// Aggregate task counts.
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats(Utc::now())?)
    }

    /// How workers and waiters wait for changes.
    pub fn wake_strategy(&self) -> WakeStrategy {
        self.wake.clone()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn ChangeBus> {
        &self.bus
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

/// Builder for creating a scheduler.
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    bus: Option<Arc<dyn ChangeBus>>,
    polling_only: bool,
    handlers: HandlerRegistry,
    locks: Option<Arc<LockManager>>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Create a new scheduler builder.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            bus: None,
            polling_only: false,
            handlers: HandlerRegistry::new(),
            locks: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Use `bus` for change notifications. Schedulers sharing a bus wake
    /// each other; without one a private in-process bus is created.
    pub fn with_bus(mut self, bus: Arc<dyn ChangeBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Never rely on notifications: workers and waiters re-read the store
    /// every poll interval and publishes go nowhere. For processes that
    /// share the database, but no bus, with the workers. Overrides
    /// [`with_bus`](Self::with_bus).
    pub fn with_polling_only(mut self) -> Self {
        self.polling_only = true;
        self
    }

    /// Register a natively hosted handler.
    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler,
        options: HandlerOptions,
    ) -> Self {
        self.handlers.register_native(task_type, handler, options);
        self
    }

    /// Register a handler hosted on the blocking pool.
    pub fn with_blocking_handler(
        mut self,
        task_type: impl Into<String>,
        handler: impl BlockingTaskHandler,
        options: HandlerOptions,
    ) -> Self {
        self.handlers.register_blocking(task_type, handler, options);
        self
    }

    /// Register a custom runner.
    pub fn with_runner(
        mut self,
        task_type: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
        options: HandlerOptions,
    ) -> Self {
        self.handlers.register_runner(task_type, runner, options);
        self
    }

    /// Share named mutexes with other schedulers in this process.
    pub fn with_lock_manager(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_poll_interval(interval);
        self
    }

    /// Set the maximum concurrent tasks.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.config = self.config.with_max_concurrent_tasks(max);
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> Scheduler {
        let poll_interval = self.config.poll_interval;
        let (bus, wake): (Arc<dyn ChangeBus>, WakeStrategy) = if self.polling_only {
            (Arc::new(PollingBus), WakeStrategy::poll(poll_interval))
        } else {
            let bus = self.bus.unwrap_or_else(|| Arc::new(LocalChangeBus::new()));
            let wake = WakeStrategy::notify(Arc::clone(&bus), poll_interval);
            (bus, wake)
        };

        Scheduler {
            store: self.store,
            bus,
            wake,
            handlers: Arc::new(self.handlers),
            locks: self.locks.unwrap_or_default(),
            config: self.config,
        }
    }
}

/// Coarse lifecycle state of a task, derived from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its first attempt or for a retry.
    Pending,
    /// Failed at least once and waiting out its backoff.
    Backoff,
    /// An attempt holds a live lease.
    Executing,
    /// Cancel requested; the in-flight attempt has not acknowledged yet.
    CancelRequested,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Backoff => "backoff",
            TaskStatus::Executing => "executing",
            TaskStatus::CancelRequested => "cancel_requested",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Read-only snapshot of a task, as returned by `describe_task`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDescription {
    pub id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub failures: u32,
    pub last_errors: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub finished: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub lease_owner: Option<String>,
}

impl TaskDescription {
    pub fn from_task(task: &ManagedTask, now: DateTime<Utc>) -> Self {
        let status = match &task.result {
            Some(TaskResult::Completed { .. }) => TaskStatus::Completed,
            Some(TaskResult::Failed { .. }) => TaskStatus::Failed,
            Some(TaskResult::Cancelled { .. }) => TaskStatus::Cancelled,
            None if task.cancelled.is_some() => TaskStatus::CancelRequested,
            None if task.is_executing(now) => TaskStatus::Executing,
            None if task.in_backoff(now) => TaskStatus::Backoff,
            None => TaskStatus::Pending,
        };

        Self {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            status,
            created: task.created,
            not_before: task.not_before,
            next_attempt: task.next_attempt,
            failures: task.failures,
            last_errors: task.last_errors.clone(),
            failure_kind: task.failure_kind,
            finished: task.finished,
            cancelled: task.cancelled,
            result: task.result.clone(),
            lease_owner: task
                .lease
                .as_ref()
                .filter(|lease| lease.is_live(now))
                .map(|lease| lease.owner.clone()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}
