//! Shared handlers and setup for the scheduler integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use vigil_scheduler::prelude::*;
use vigil_scheduler::{SchedulerBuilder, TaskStatus};
use vigil_sqlite::SqliteTaskStore;

pub const PING: &str = "test:ping";
pub const PING_RETRY2: &str = "test:pingretry2";
pub const SLEEP: &str = "test:sleep";
pub const SLEEP_BLOCKING: &str = "test:sleep_blocking";
pub const CANCELLABLE: &str = "test:cancellable";
pub const COUNTER: &str = "test:counter";
pub const AUX: &str = "test:aux";
pub const BLOCKING_ERROR: &str = "test:blocking_error";

/// Side effects recorded by the test handlers
#[derive(Clone, Default)]
pub struct Recorder {
    /// Handler invocations per task id
    pub runs: Arc<Mutex<HashMap<String, usize>>>,
    /// Set by the cancellable handler once it released its resources
    pub released: Arc<AtomicBool>,
}

impl Recorder {
    pub fn runs_of(&self, id: &TaskId) -> usize {
        self.runs.lock().get(id.as_str()).copied().unwrap_or(0)
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().values().sum()
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn open_store(dir: &Path) -> Arc<dyn TaskStore> {
    Arc::new(SqliteTaskStore::open(StoreConfig::new(dir.join("tasks.db"))).unwrap())
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_poll_interval(Duration::from_millis(50))
        .with_lease_duration(Duration::from_secs(5))
        .with_lease_grace(Duration::from_millis(500))
}

/// A scheduler with every test handler registered
pub fn scheduler(store: Arc<dyn TaskStore>, bus: Arc<dyn ChangeBus>, recorder: &Recorder) -> Scheduler {
    builder(store, recorder).with_bus(bus).build()
}

/// Builder with every test handler registered and the test configuration
pub fn builder(store: Arc<dyn TaskStore>, recorder: &Recorder) -> SchedulerBuilder {
    let runs = recorder.runs.clone();
    let released = recorder.released.clone();

    Scheduler::builder(store)
        .with_config(test_config())
        .with_handler(
            PING,
            handler_fn(|ctx: TaskContext| async move {
                let ping = ctx.task_data["ping"].clone();
                match ping.as_str() {
                    Some("FAIL") => Ok(TaskResolution::temporary_failure("ping failed")),
                    Some("PERM") => Ok(TaskResolution::permanent_failure("ping rejected")),
                    _ => Ok(TaskResolution::completed(
                        json!({"pong": ping, "managedtaskid": ctx.task_id}),
                    )),
                }
            }),
            HandlerOptions::new(),
        )
        .with_handler(
            PING_RETRY2,
            handler_fn(|ctx: TaskContext| async move {
                let ping = ctx.task_data["ping"].clone();
                if ping == json!("ABORT") {
                    return Err(HandlerError::abort("ABORT requested"));
                }
                Ok(TaskResolution::completed(
                    json!({"pong": ping, "managedtaskid": ctx.task_id}),
                ))
            }),
            HandlerOptions::new().with_max_failures(2),
        )
        .with_handler(
            SLEEP,
            handler_fn(|ctx: TaskContext| async move {
                let ms = ctx.task_data["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(TaskResolution::completed(json!({"slept": ms})))
            }),
            HandlerOptions::new(),
        )
        .with_blocking_handler(
            SLEEP_BLOCKING,
            blocking_handler_fn(|ctx: TaskContext| {
                let ms = ctx.task_data["ms"].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(TaskResolution::completed(json!({"slept": ms})))
            }),
            HandlerOptions::new(),
        )
        .with_blocking_handler(
            BLOCKING_ERROR,
            blocking_handler_fn(|_ctx: TaskContext| Err(anyhow::anyhow!("disk on fire").into())),
            HandlerOptions::new(),
        )
        .with_handler(
            CANCELLABLE,
            handler_fn(move |mut ctx: TaskContext| {
                let released = released.clone();
                async move {
                    let steps = ctx.task_data["steps"].as_u64().unwrap_or(1000);
                    let mut progress = 0u64;
                    while progress < steps {
                        tokio::select! {
                            _ = ctx.cancelled() => {
                                // Simulate releasing a held resource
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                released.store(true, Ordering::SeqCst);
                                return Ok(TaskResolution::temporary_failure("cancelled on request")
                                    .with_data(json!({"progress": progress})));
                            }
                            _ = tokio::time::sleep(Duration::from_millis(20)) => progress += 1,
                        }
                    }
                    Ok(TaskResolution::completed(json!({"progress": progress})))
                }
            }),
            HandlerOptions::new().cancellable(),
        )
        .with_handler(
            COUNTER,
            handler_fn(move |ctx: TaskContext| {
                let runs = runs.clone();
                async move {
                    let n = {
                        let mut runs = runs.lock();
                        let n = runs.entry(ctx.task_id.to_string()).or_insert(0);
                        *n += 1;
                        *n
                    };
                    // Give racing workers a chance to trip over each other
                    let ms = ctx.task_data["ms"].as_u64().unwrap_or(5);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(TaskResolution::completed(json!({"n": n})))
                }
            }),
            HandlerOptions::new(),
        )
        .with_handler(
            AUX,
            handler_fn(|ctx: TaskContext| async move {
                Ok(TaskResolution::completed(json!({"aux": ctx.auxdata})))
            }),
            HandlerOptions::new(),
        )
}

/// One scheduler with a running worker over a fresh database
pub struct Harness {
    pub dir: TempDir,
    pub bus: Arc<LocalChangeBus>,
    pub recorder: Recorder,
    pub scheduler: Scheduler,
    pub worker: Worker,
    handle: JoinHandle<vigil_scheduler::Result<()>>,
}

impl Harness {
    pub fn start() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(LocalChangeBus::new());
        let recorder = Recorder::default();
        let scheduler = scheduler(open_store(dir.path()), bus.clone(), &recorder);
        let (worker, handle) = spawn_worker(&scheduler);

        Self {
            dir,
            bus,
            recorder,
            scheduler,
            worker,
            handle,
        }
    }

    /// Schedule one task and commit
    pub fn schedule(&self, task_type: &str, data: serde_json::Value, options: ScheduleOptions) -> TaskId {
        let mut work = self.scheduler.begin_work().unwrap();
        let id = work.schedule_task(task_type, data, options).unwrap();
        work.commit().unwrap();
        id
    }

    pub fn retry(&self, id: &TaskId) -> usize {
        let mut work = self.scheduler.begin_work().unwrap();
        let retried = work.retry_task(id).unwrap();
        work.commit().unwrap();
        retried
    }

    pub async fn stop(self) {
        stop_worker(&self.worker, self.handle).await;
    }
}

pub fn spawn_worker(scheduler: &Scheduler) -> (Worker, JoinHandle<vigil_scheduler::Result<()>>) {
    let worker = scheduler.worker();
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });
    (worker, handle)
}

pub async fn stop_worker(worker: &Worker, handle: JoinHandle<vigil_scheduler::Result<()>>) {
    worker.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("worker should stop")
        .expect("worker should not panic")
        .expect("worker should exit cleanly");
}

/// Poll until the task reaches `status`
pub async fn wait_for_status(scheduler: &Scheduler, id: &TaskId, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let described = scheduler.describe_task(id).unwrap();
        if described.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {:?}, expected {status:?}",
            described.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait with a generous limit so a hung test fails instead of blocking
pub fn bounded() -> RetrieveOptions {
    RetrieveOptions::new().timeout(Duration::from_secs(10))
}
