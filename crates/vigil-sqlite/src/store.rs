use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use vigil_core::{
    error::{Result, VigilError},
    traits::{TaskStore, TaskTxn},
    types::{ManagedTask, StoreStats, TaskFilter, TaskId},
    StoreConfig,
};

use crate::read_pool::{shared_memory_flags, SqliteReadPool};
use crate::rows::{store_err, task_from_row, to_millis, TASK_COLUMNS};
use crate::schema;
use crate::txn::SqliteTaskTxn;

/// SQLite-backed task store
///
/// One store owns one writer connection plus a small pool of read
/// connections. Several stores (in one process or many) may open the same
/// database file; SQLite's file locking plus `BEGIN IMMEDIATE` transactions
/// serialize their writers.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    readers: SqliteReadPool,
    config: StoreConfig,
}

static MEMORY_STORES: AtomicU64 = AtomicU64::new(0);

impl SqliteTaskStore {
    /// Open (creating if needed) the store described by `cfg`
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &cfg.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(store_err)?;

        Self::configure_connection(&conn, &cfg)?;
        schema::init_schema(&conn)?;

        // Readers open after the schema exists
        let readers = SqliteReadPool::open(
            &cfg.path,
            &cfg.read_pool,
            Duration::from_millis(cfg.busy_timeout_ms),
        )?;

        debug!(
            path = %cfg.path.display(),
            readers = readers.pool_size(),
            "Opened task store"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers,
            config: cfg,
        })
    }

    /// Open a private in-memory store (not shareable across processes)
    ///
    /// Readers of an in-memory store can see writes of a transaction that
    /// is still open.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:vigil-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            MEMORY_STORES.fetch_add(1, Ordering::Relaxed)
        );
        let conn = Connection::open_with_flags(&uri, shared_memory_flags()).map_err(store_err)?;
        let cfg = StoreConfig::new(":memory:").with_wal_mode(false);
        Self::configure_connection(&conn, &cfg)?;
        schema::init_schema(&conn)?;
        let readers = SqliteReadPool::open_shared_memory(&uri, &cfg.read_pool)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers,
            config: cfg,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get the underlying writer connection (for custom queries)
    pub fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VigilError::Store("connection mutex poisoned".into()))
    }

    /// Configure SQLite connection
    fn configure_connection(conn: &Connection, cfg: &StoreConfig) -> Result<()> {
        // Set first so the pragmas below wait on a busy file too
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .map_err(|e| VigilError::Config(e.to_string()))?;

        if cfg.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| VigilError::Config(e.to_string()))?;
        }

        conn.pragma_update(None, "synchronous", cfg.synchronous.as_pragma())
            .map_err(|e| VigilError::Config(e.to_string()))?;

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| VigilError::Config(e.to_string()))?;

        conn.pragma_update(None, "cache_size", cfg.cache_size)
            .map_err(|e| VigilError::Config(e.to_string()))?;

        Ok(())
    }
}

impl TaskStore for SqliteTaskStore {
    fn begin(&self) -> Result<Box<dyn TaskTxn + '_>> {
        let guard = self.lock()?;
        Ok(Box::new(SqliteTaskTxn::new(guard)?))
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<ManagedTask>> {
        let conn = self.readers.acquire()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM managed_tasks WHERE id = ?1"),
            params![id.as_str()],
            task_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    /// All filter values are passed as bound parameters.
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ManagedTask>> {
        let mut query = format!("SELECT {TASK_COLUMNS} FROM managed_tasks WHERE 1=1");
        let mut bound_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(task_type) = &filter.task_type {
            query.push_str(" AND task_type = ?");
            bound_params.push(Box::new(task_type.clone()));
        }

        if let Some(after) = filter.created_after {
            query.push_str(" AND created > ?");
            bound_params.push(Box::new(to_millis(after)));
        }

        if filter.only_pending {
            query.push_str(" AND finished IS NULL");
        }

        query.push_str(" ORDER BY created DESC, id ASC");

        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            bound_params.push(Box::new(limit as i64));
        }

        let conn = self.readers.acquire()?;
        let mut stmt = conn.prepare(&query).map_err(store_err)?;
        let tasks = stmt
            .query_map(
                rusqlite::params_from_iter(bound_params.iter()),
                task_from_row,
            )
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;

        Ok(tasks)
    }

    fn due_tasks(
        &self,
        now: DateTime<Utc>,
        task_types: &[String],
        limit: usize,
    ) -> Result<Vec<TaskId>> {
        if task_types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; task_types.len()].join(", ");
        let query = format!(
            r#"
            SELECT id FROM managed_tasks
            WHERE finished IS NULL
              AND next_attempt <= ?
              AND (lease_expires IS NULL OR lease_expires <= ?)
              AND task_type IN ({placeholders})
            ORDER BY next_attempt ASC
            LIMIT ?
            "#
        );

        let mut bound_params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(to_millis(now)), Box::new(to_millis(now))];
        for task_type in task_types {
            bound_params.push(Box::new(task_type.clone()));
        }
        bound_params.push(Box::new(limit as i64));

        let conn = self.readers.acquire()?;
        let mut stmt = conn.prepare(&query).map_err(store_err)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(bound_params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(store_err)?
            .map(|id| id.map(TaskId::from))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;

        Ok(ids)
    }

    fn next_wake_time(&self, task_types: &[String]) -> Result<Option<DateTime<Utc>>> {
        if task_types.is_empty() {
            return Ok(None);
        }

        // A leased task becomes claimable again only once its lease expires
        let placeholders = vec!["?"; task_types.len()].join(", ");
        let query = format!(
            r#"
            SELECT MIN(CASE WHEN lease_expires IS NULL THEN next_attempt
                            ELSE MAX(next_attempt, lease_expires) END)
            FROM managed_tasks
            WHERE finished IS NULL
              AND task_type IN ({placeholders})
            "#
        );

        let conn = self.readers.acquire()?;
        let next: Option<i64> = conn
            .query_row(&query, rusqlite::params_from_iter(task_types.iter()), |row| {
                row.get(0)
            })
            .map_err(store_err)?;

        Ok(next.and_then(DateTime::from_timestamp_millis))
    }

    fn load_auxdata(&self, id: &TaskId) -> Result<Option<Value>> {
        let conn = self.readers.acquire()?;
        let text: Option<String> = conn
            .query_row(
                "SELECT data FROM managed_task_auxdata WHERE task_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;

        Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(store_err)?;

        tx.execute(
            r#"
            DELETE FROM managed_task_auxdata
            WHERE task_id IN (
                SELECT id FROM managed_tasks WHERE finished IS NOT NULL AND finished < ?1
            )
            "#,
            params![to_millis(before)],
        )
        .map_err(store_err)?;

        let removed = tx
            .execute(
                "DELETE FROM managed_tasks WHERE finished IS NOT NULL AND finished < ?1",
                params![to_millis(before)],
            )
            .map_err(store_err)?;

        tx.commit().map_err(store_err)?;

        debug!(removed, "Purged finished tasks");
        Ok(removed)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let conn = self.readers.acquire()?;
        let (pending, executing, completed, failed, cancelled) = conn
            .query_row(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN finished IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN finished IS NULL AND lease_expires > ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN json_extract(result, '$.status') = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN json_extract(result, '$.status') = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN json_extract(result, '$.status') = 'cancelled' THEN 1 ELSE 0 END), 0)
                FROM managed_tasks
                "#,
                params![to_millis(now)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .map_err(store_err)?;

        Ok(StoreStats {
            pending: pending as u64,
            executing: executing as u64,
            completed: completed as u64,
            failed: failed as u64,
            cancelled: cancelled as u64,
            schema_version: schema::schema_version(&conn)?,
        })
    }

    fn schema_version(&self) -> Result<u32> {
        let conn = self.readers.acquire()?;
        schema::schema_version(&conn)
    }
}
