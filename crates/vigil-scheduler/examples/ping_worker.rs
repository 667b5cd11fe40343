//! Ping worker example
//!
//! Demonstrates:
//! - Registering a native handler
//! - Running a worker next to the scheduling code
//! - Waiting for a task result
//!
//! Run with `RUST_LOG=vigil_scheduler=debug` to watch the claim and report.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vigil_scheduler::prelude::*;
use vigil_sqlite::SqliteTaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigil_scheduler=info")),
        )
        .init();

    println!("=== Vigil Ping Example ===\n");

    let dir = tempfile::tempdir()?;
    let store = Arc::new(SqliteTaskStore::open(StoreConfig::new(
        dir.path().join("tasks.db"),
    ))?);

    let scheduler = Scheduler::builder(store)
        .with_handler(
            "example:ping",
            handler_fn(|ctx: TaskContext| async move {
                println!("[Task {}] attempt #{}", ctx.task_id, ctx.attempt);
                Ok(TaskResolution::completed(json!({
                    "pong": ctx.task_data["ping"],
                    "managedtaskid": ctx.task_id,
                })))
            }),
            HandlerOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .with_poll_interval(Duration::from_millis(200))
        .build();

    let worker = scheduler.worker();
    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    let mut work = scheduler.begin_work()?;
    let id = work.schedule_task("example:ping", json!({"ping": "hello"}), ScheduleOptions::new())?;
    work.commit()?;
    println!("Scheduled {id}");

    let result = scheduler
        .retrieve_task_result(&id, RetrieveOptions::new().timeout(Duration::from_secs(10)))
        .await?;
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    println!("\nStats: {:?}", scheduler.stats()?);

    worker.shutdown();
    running.await??;
    Ok(())
}
