//! Convenience re-exports for common types.

pub use crate::cancellation::CancelHandle;
pub use crate::config::SchedulerConfig;
pub use crate::error::{Result, SchedulerError};
pub use crate::scheduler::{Scheduler, SchedulerBuilder, TaskDescription, TaskStatus};
pub use crate::task_handler::{
    blocking_handler_fn, handler_fn, BlockingTaskHandler, HandlerError, HandlerOptions,
    HandlerResult, TaskContext, TaskHandler, TaskResolution,
};
pub use crate::waiter::RetrieveOptions;
pub use crate::work::{RetryTarget, ScheduleOptions, Work};
pub use crate::worker::Worker;
pub use vigil_bus::{ChangeBus, LocalChangeBus};
pub use vigil_core::{StoreConfig, TaskFilter, TaskId, TaskStore};
