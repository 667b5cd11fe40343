//! Vigil Scheduler
//!
//! Durable task scheduling and execution on top of a transactional
//! [`TaskStore`](vigil_core::TaskStore).
//!
//! # Overview
//!
//! - **Scheduling**: tasks are created, retried and cancelled inside a
//!   [`Work`] transaction; nothing is claimable before it commits
//! - **Workers**: any number of [`Worker`]s, in one process or many, claim
//!   due tasks under an exclusive lease and run their handlers
//! - **Handlers**: one per task type, hosted natively (async) or on the
//!   blocking pool behind the same [`TaskRunner`] interface
//! - **Retries**: temporary failures back off along a fixed table
//!   (15 minutes doubling up to a day)
//! - **Results**: [`Scheduler::retrieve_task_result`] waits for a terminal
//!   state with configurable acceptance of early outcomes
//! - **Cancellation**: idle tasks are cancelled in the transaction; running
//!   cancellable attempts are signalled over a live channel and acknowledged
//!   when it closes
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use std::sync::Arc;
//! use vigil_scheduler::prelude::*;
//! use vigil_sqlite::SqliteTaskStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteTaskStore::open(StoreConfig::new("./tasks.db"))?);
//!
//!     let scheduler = Scheduler::builder(store)
//!         .with_handler(
//!             "demo:ping",
//!             handler_fn(|ctx: TaskContext| async move {
//!                 Ok(TaskResolution::completed(json!({"pong": ctx.task_data["ping"]})))
//!             }),
//!             HandlerOptions::new(),
//!         )
//!         .build();
//!
//!     let worker = scheduler.worker();
//!     tokio::spawn({
//!         let worker = worker.clone();
//!         async move { worker.run().await }
//!     });
//!
//!     let mut work = scheduler.begin_work()?;
//!     let id = work.schedule_task("demo:ping", json!({"ping": 42}), ScheduleOptions::new())?;
//!     work.commit()?;
//!
//!     let value = scheduler.retrieve_task_result(&id, RetrieveOptions::new()).await?;
//!     println!("{value:?}");
//!
//!     worker.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cancellation;
pub mod config;
pub mod error;
mod execution;
pub mod scheduler;
pub mod task_handler;
pub mod waiter;
pub mod work;
pub mod worker;

pub mod prelude;

// Re-export main types
pub use cancellation::CancelHandle;
pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use scheduler::{Scheduler, SchedulerBuilder, TaskDescription, TaskStatus};
pub use task_handler::{
    blocking_handler_fn, handler_fn, AttemptOutcome, BlockingRunner, BlockingTaskHandler,
    ControlMessage, HandlerError, HandlerOptions, HandlerRegistry, HandlerResult, HostingKind,
    NativeRunner, TaskChannel, TaskContext, TaskHandler, TaskResolution, TaskRunner,
};
pub use waiter::{RetrieveOptions, WaitLimit};
pub use work::{RetryTarget, ScheduleOptions, Work};
pub use worker::Worker;
