//! SQLite Read Connection Pool
//!
//! Reads outside a write transaction run on their own connections, so a
//! caller holding a `Work` open never blocks `get_task`, `list_tasks` or the
//! worker's due-task scan on the same store.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vigil_core::{
    error::{Result, VigilError},
    ReadPoolConfig,
};

use crate::rows::store_err;

/// Pool of read connections for one store
///
/// File-backed stores open their readers `SQLITE_OPEN_READ_ONLY`; in WAL
/// mode a reader sees the last committed state and never waits on the
/// writer. In-memory stores share one named in-memory database between the
/// writer and the readers; those readers run in read-uncommitted mode and
/// may observe a transaction that has not committed yet.
pub struct SqliteReadPool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    acquire_timeout: Duration,
}

impl SqliteReadPool {
    /// Open `config.pool_size` read-only connections to a database file
    pub fn open(
        db_path: &std::path::Path,
        config: &ReadPoolConfig,
        busy_timeout: Duration,
    ) -> Result<Self> {
        Self::open_with(config, || {
            let conn = Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(store_err)?;
            conn.busy_timeout(busy_timeout).map_err(store_err)?;
            Ok(conn)
        })
    }

    /// Open readers on a shared-cache in-memory database
    pub(crate) fn open_shared_memory(uri: &str, config: &ReadPoolConfig) -> Result<Self> {
        Self::open_with(config, || {
            let conn = Connection::open_with_flags(uri, shared_memory_flags()).map_err(store_err)?;
            conn.pragma_update(None, "read_uncommitted", true)
                .map_err(store_err)?;
            conn.pragma_update(None, "query_only", true)
                .map_err(store_err)?;
            Ok(conn)
        })
    }

    fn open_with(
        config: &ReadPoolConfig,
        mut open: impl FnMut() -> Result<Connection>,
    ) -> Result<Self> {
        let pool_size = config.pool_size.max(1);
        let connections = (0..pool_size)
            .map(|_| open().map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        })
    }

    /// Acquire a read connection
    ///
    /// Takes the first idle connection. When all are busy, waits up to the
    /// configured timeout on the next one in rotation.
    pub fn acquire(&self) -> Result<MutexGuard<'_, Connection>> {
        for conn in &self.connections {
            if let Some(guard) = conn.try_lock() {
                return Ok(guard);
            }
        }

        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[slot]
            .try_lock_for(self.acquire_timeout)
            .ok_or(VigilError::LockTimeout {
                timeout_ms: self.acquire_timeout.as_millis() as u64,
            })
    }

    /// Get the pool size
    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }
}

pub(crate) fn shared_memory_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_SHARED_CACHE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}
