use rusqlite::Connection;
use vigil_core::error::{Result, VigilError};

/// Schema version created by [`init_schema`]
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Create the task tables if they do not exist yet
///
/// The `CHECK` on `managed_tasks` mirrors the record invariant: a task is
/// either pending with a `next_attempt` or finished, never both.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS managed_tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            task_data TEXT NOT NULL,
            created INTEGER NOT NULL,
            not_before INTEGER NOT NULL,
            next_attempt INTEGER,
            failures INTEGER NOT NULL DEFAULT 0,
            last_errors TEXT,
            failure_kind TEXT,
            last_data TEXT,
            finished INTEGER,
            result TEXT,
            cancelled INTEGER,
            timeout_ms INTEGER,
            lease_token TEXT,
            lease_owner TEXT,
            lease_expires INTEGER,
            has_auxdata INTEGER NOT NULL DEFAULT 0,
            CHECK ((finished IS NULL) <> (next_attempt IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_managed_tasks_due
            ON managed_tasks(next_attempt) WHERE finished IS NULL;

        CREATE INDEX IF NOT EXISTS idx_managed_tasks_type
            ON managed_tasks(task_type, created);

        CREATE TABLE IF NOT EXISTS managed_task_auxdata (
            task_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES managed_tasks(id) ON DELETE CASCADE
        );
        "#,
    )
    .map_err(|e| VigilError::Store(e.to_string()))?;

    conn.execute(
        "INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (0, ?1)",
        [CURRENT_SCHEMA_VERSION as i64],
    )
    .map_err(|e| VigilError::Store(e.to_string()))?;

    Ok(())
}

/// Read the recorded schema version
pub fn schema_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT schema_version FROM store_meta WHERE id = 0",
        [],
        |row| {
            let v: i64 = row.get(0)?;
            Ok(v as u32)
        },
    )
    .map_err(|e| VigilError::Store(e.to_string()))
}
