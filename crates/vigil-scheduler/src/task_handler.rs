//! Task handler contract, hosting runtimes and registry.
//!
//! Every task type maps to exactly one handler. A handler is hosted either
//! natively (an async fn on the tokio runtime) or on the blocking pool; both
//! are wrapped in a [`TaskRunner`] so the worker treats them uniformly.

use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use vigil_core::{FailureKind, LockManager, TaskId};

/// Out-of-band control messages delivered to a running cancellable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Abort the attempt and release resources promptly.
    Cancel,
}

/// Live channel between a worker and one cancellable attempt.
///
/// Dropping the channel (which happens when the handler returns and its
/// context goes away) is the acknowledgement the worker waits for.
#[derive(Debug)]
pub struct TaskChannel {
    rx: mpsc::Receiver<ControlMessage>,
    cancelled: bool,
}

impl TaskChannel {
    pub(crate) fn pair() -> (mpsc::Sender<ControlMessage>, TaskChannel) {
        let (tx, rx) = mpsc::channel(4);
        (tx, TaskChannel { rx, cancelled: false })
    }

    /// Resolves once a cancel signal arrives.
    pub async fn cancelled(&mut self) {
        if self.cancelled {
            return;
        }
        match self.rx.recv().await {
            Some(ControlMessage::Cancel) => self.cancelled = true,
            // Worker gone without signalling; nothing will ever arrive
            None => std::future::pending::<()>().await,
        }
    }

    /// Non-blocking check, usable from blocking handlers too.
    pub fn is_cancelled(&mut self) -> bool {
        while let Ok(ControlMessage::Cancel) = self.rx.try_recv() {
            self.cancelled = true;
        }
        self.cancelled
    }
}

/// Context provided to task handlers during an attempt.
pub struct TaskContext {
    /// Unique identifier for the task.
    pub task_id: TaskId,
    /// Registered type of the task.
    pub task_type: String,
    /// Payload given at scheduling time.
    pub task_data: Value,
    /// Side payload, loaded only for tasks scheduled with one.
    pub auxdata: Option<Value>,
    /// Attempt number (1 for the first attempt).
    pub attempt: u32,
    channel: Option<TaskChannel>,
    locks: Arc<LockManager>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        task_type: String,
        task_data: Value,
        attempt: u32,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            task_data,
            auxdata: None,
            attempt,
            channel: None,
            locks,
        }
    }

    pub(crate) fn with_auxdata(mut self, auxdata: Option<Value>) -> Self {
        self.auxdata = auxdata;
        self
    }

    pub(crate) fn with_channel(mut self, channel: TaskChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Deserialize the task payload.
    pub fn data<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_value(self.task_data.clone())
            .map_err(|e| HandlerError::Failed(anyhow::Error::new(e).context("invalid task data")))
    }

    /// The cancellation channel; `None` unless the task type is cancellable.
    pub fn channel(&mut self) -> Option<&mut TaskChannel> {
        self.channel.as_mut()
    }

    /// Whether a cancel signal has arrived.
    pub fn is_cancelled(&mut self) -> bool {
        self.channel.as_mut().is_some_and(TaskChannel::is_cancelled)
    }

    /// Resolves once a cancel signal arrives. Never resolves for task types
    /// that are not cancellable.
    pub async fn cancelled(&mut self) {
        match self.channel.as_mut() {
            Some(channel) => channel.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Named mutexes for cross-task serialization within this process.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
}

/// How a handler resolved its attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    /// Terminal success.
    Completed(Value),
    /// Retryable failure; rescheduled by backoff unless `next_retry` is set.
    TemporaryFailure {
        message: String,
        data: Option<Value>,
        next_retry: Option<DateTime<Utc>>,
    },
    /// Terminal failure.
    PermanentFailure { message: String, data: Option<Value> },
}

impl TaskResolution {
    pub fn completed(value: Value) -> Self {
        Self::Completed(value)
    }

    pub fn temporary_failure(message: impl Into<String>) -> Self {
        Self::TemporaryFailure {
            message: message.into(),
            data: None,
            next_retry: None,
        }
    }

    pub fn permanent_failure(message: impl Into<String>) -> Self {
        Self::PermanentFailure {
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data snapshot to a failure. No effect on `Completed`.
    pub fn with_data(mut self, snapshot: Value) -> Self {
        match &mut self {
            Self::TemporaryFailure { data, .. } | Self::PermanentFailure { data, .. } => {
                *data = Some(snapshot)
            }
            Self::Completed(_) => {}
        }
        self
    }

    /// Override the backoff of a temporary failure.
    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        if let Self::TemporaryFailure { next_retry, .. } = &mut self {
            *next_retry = Some(at);
        }
        self
    }
}

/// Error raised by a handler instead of resolving.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Immediate-termination signal; always surfaced to waiters as an error.
    #[error("Task attempted to abort: {0}")]
    Abort(String),

    /// Anything else; recorded as an implicit temporary failure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }
}

pub type HandlerResult = std::result::Result<TaskResolution, HandlerError>;

/// Handler hosted natively on the async runtime.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> HandlerResult;
}

/// Handler hosted on the blocking thread pool.
pub trait BlockingTaskHandler: Send + Sync + 'static {
    fn run(&self, ctx: TaskContext) -> HandlerResult;
}

/// Native handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Blocking handler built from a closure. See [`blocking_handler_fn`].
pub struct BlockingFnHandler<F>(F);

/// Wrap a synchronous closure as a [`BlockingTaskHandler`].
pub fn blocking_handler_fn<F>(f: F) -> BlockingFnHandler<F>
where
    F: Fn(TaskContext) -> HandlerResult + Send + Sync + 'static,
{
    BlockingFnHandler(f)
}

impl<F> BlockingTaskHandler for BlockingFnHandler<F>
where
    F: Fn(TaskContext) -> HandlerResult + Send + Sync + 'static,
{
    fn run(&self, ctx: TaskContext) -> HandlerResult {
        (self.0)(ctx)
    }
}

/// Where a handler executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostingKind {
    Native,
    Blocking,
}

impl HostingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostingKind::Native => "native",
            HostingKind::Blocking => "blocking",
        }
    }
}

/// Result of running one attempt, before it is reported to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The handler resolved explicitly.
    Resolved(TaskResolution),
    /// The handler errored, aborted, panicked or timed out.
    Failed { message: String, kind: FailureKind },
}

impl AttemptOutcome {
    fn from_result(result: HandlerResult, annotate: impl Fn(String) -> String) -> Self {
        match result {
            Ok(resolution) => AttemptOutcome::Resolved(resolution),
            Err(err @ HandlerError::Abort(_)) => AttemptOutcome::Failed {
                message: err.to_string(),
                kind: FailureKind::Abort,
            },
            Err(HandlerError::Failed(err)) => AttemptOutcome::Failed {
                message: annotate(format!("{err:#}")),
                kind: FailureKind::Temporary,
            },
        }
    }

    fn timed_out(limit: Duration) -> Self {
        AttemptOutcome::Failed {
            message: format!("Task has timed out after {}ms", limit.as_millis()),
            kind: FailureKind::Timeout,
        }
    }

    fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        AttemptOutcome::Failed {
            message: format!("Task panicked: {detail}"),
            kind: FailureKind::Temporary,
        }
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Resolved(TaskResolution::Completed(_)) => "completed",
            AttemptOutcome::Resolved(TaskResolution::TemporaryFailure { .. }) => "temporary_failure",
            AttemptOutcome::Resolved(TaskResolution::PermanentFailure { .. }) => "permanent_failure",
            AttemptOutcome::Failed { kind, .. } => kind.as_str(),
        }
    }
}

/// Uniform interface over the hosting runtimes.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    fn kind(&self) -> HostingKind;

    /// Run one attempt, enforcing `timeout` if given. Never panics on
    /// behalf of the handler.
    async fn run(&self, ctx: TaskContext, timeout: Option<Duration>) -> AttemptOutcome;
}

/// Runs a [`TaskHandler`] as its own tokio task. A timeout aborts it.
pub struct NativeRunner {
    handler: Arc<dyn TaskHandler>,
}

impl NativeRunner {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl TaskRunner for NativeRunner {
    fn kind(&self) -> HostingKind {
        HostingKind::Native
    }

    async fn run(&self, ctx: TaskContext, timeout: Option<Duration>) -> AttemptOutcome {
        let handler = Arc::clone(&self.handler);
        let mut join = tokio::spawn(async move { handler.run(ctx).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return AttemptOutcome::timed_out(limit);
                }
            },
            None => join.await,
        };

        match joined {
            Ok(result) => AttemptOutcome::from_result(result, |message| message),
            Err(e) if e.is_panic() => AttemptOutcome::panicked(e.into_panic()),
            Err(e) => AttemptOutcome::Failed {
                message: format!("Task was aborted: {e}"),
                kind: FailureKind::Temporary,
            },
        }
    }
}

/// Runs a [`BlockingTaskHandler`] on the blocking pool.
///
/// A blocking thread cannot be interrupted: on timeout the attempt is failed
/// and the thread is detached, left to finish on its own.
pub struct BlockingRunner {
    handler: Arc<dyn BlockingTaskHandler>,
}

impl BlockingRunner {
    pub fn new(handler: Arc<dyn BlockingTaskHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl TaskRunner for BlockingRunner {
    fn kind(&self) -> HostingKind {
        HostingKind::Blocking
    }

    async fn run(&self, ctx: TaskContext, timeout: Option<Duration>) -> AttemptOutcome {
        let handler = Arc::clone(&self.handler);
        let task_type = ctx.task_type.clone();
        let attempt = ctx.attempt;
        let join = tokio::task::spawn_blocking(move || handler.run(ctx));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, join).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(task_type = %task_type, attempt, "Detaching timed out blocking handler");
                    return AttemptOutcome::timed_out(limit);
                }
            },
            None => join.await,
        };

        let annotate =
            |message: String| format!("{message}\n    at blocking handler '{task_type}' (attempt {attempt})");

        match joined {
            Ok(result) => AttemptOutcome::from_result(result, annotate),
            Err(e) if e.is_panic() => match AttemptOutcome::panicked(e.into_panic()) {
                AttemptOutcome::Failed { message, kind } => AttemptOutcome::Failed {
                    message: annotate(message),
                    kind,
                },
                other => other,
            },
            Err(e) => AttemptOutcome::Failed {
                message: annotate(format!("Task was aborted: {e}")),
                kind: FailureKind::Temporary,
            },
        }
    }
}

/// Per-type handler options.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Whether attempts get a live [`TaskChannel`] and receive cancel signals.
    pub cancellable: bool,
    /// Default per-attempt timeout; a timeout given at scheduling wins.
    pub timeout: Option<Duration>,
    /// Failure count at which a temporary failure becomes permanent.
    pub max_failures: Option<u32>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures.max(1));
        self
    }
}

/// A runner plus its options, as stored in the registry.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub runner: Arc<dyn TaskRunner>,
    pub options: HandlerOptions,
}

/// Registry of task handlers, keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a natively hosted handler.
    pub fn register_native(
        &mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler,
        options: HandlerOptions,
    ) {
        self.register_runner(task_type, Arc::new(NativeRunner::new(Arc::new(handler))), options);
    }

    /// Register a handler hosted on the blocking pool.
    pub fn register_blocking(
        &mut self,
        task_type: impl Into<String>,
        handler: impl BlockingTaskHandler,
        options: HandlerOptions,
    ) {
        self.register_runner(task_type, Arc::new(BlockingRunner::new(Arc::new(handler))), options);
    }

    /// Register any runner. Replaces an earlier registration of the type.
    pub fn register_runner(
        &mut self,
        task_type: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
        options: HandlerOptions,
    ) {
        self.handlers
            .insert(task_type.into(), RegisteredHandler { runner, options });
    }

    /// Get a handler by task type.
    pub fn get(&self, task_type: &str) -> Result<&RegisteredHandler> {
        self.handlers
            .get(task_type)
            .ok_or_else(|| SchedulerError::UnknownTaskType(task_type.to_string()))
    }

    /// Check if a handler is registered for a task type.
    pub fn has(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Get all registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
