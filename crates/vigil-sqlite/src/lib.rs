//! SQLite-backed task store
//!
//! Durable store of record for managed tasks.
//!
//! Key features:
//! - `BEGIN IMMEDIATE` write transactions (atomic claims across processes)
//! - Side table for large auxiliary payloads, loaded only on demand
//! - WAL mode plus a read connection pool, so reads see committed state
//!   and never wait on an open write transaction
//! - Schema versioning and retention purge

pub mod read_pool;
mod rows;
pub mod schema;
pub mod store;
pub mod txn;

pub use read_pool::SqliteReadPool;
pub use store::SqliteTaskStore;
pub use txn::SqliteTaskTxn;
