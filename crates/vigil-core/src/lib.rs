//! Vigil Core: task model and store abstractions for the vigil scheduler
//!
//! This crate defines the pieces every other vigil crate builds on:
//! - `ManagedTask`: the durable task record and its lifecycle transitions
//! - Backoff: the pure retry-delay table
//! - `TaskStore` / `TaskTxn`: the transactional store of record
//! - `LockManager`: named mutexes for handler-level serialization
//!
//! Store implementations live in separate crates (see `vigil-sqlite`).

pub mod backoff;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod lock_manager;
pub mod observe;
pub mod traits;
pub mod types;

pub use backoff::{backoff, backoff_delay, BACKOFF_MINUTES};
pub use config::{ReadPoolConfig, StoreConfig, SynchronousMode};
pub use error::{Result, VigilError};
pub use lifecycle::{CancelDisposition, FailureDisposition, TemporaryFailure};
pub use lock_manager::{LockManager, NamedMutexGuard};
pub use traits::{TaskStore, TaskTxn};
pub use types::{FailureKind, Lease, ManagedTask, StoreStats, TaskFilter, TaskId, TaskResult};
