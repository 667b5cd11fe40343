pub mod task;

pub use task::{FailureKind, Lease, ManagedTask, StoreStats, TaskFilter, TaskId, TaskResult};
