use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::MutexGuard;
use vigil_core::{
    error::{Result, VigilError},
    traits::TaskTxn,
    types::{ManagedTask, TaskId},
};

use crate::rows::{execute_task_statement, store_err, task_from_row, INSERT_TASK, TASK_COLUMNS, UPDATE_TASK};

/// Write transaction holding the store's connection
///
/// Opened with `BEGIN IMMEDIATE`, so the database write lock is taken up
/// front: two transactions on the same file (even from different processes)
/// never interleave their read-check-write sequences. This is what makes a
/// claim atomic.
pub struct SqliteTaskTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    in_txn: bool,
}

impl<'a> SqliteTaskTxn<'a> {
    pub fn new(conn: MutexGuard<'a, Connection>) -> Result<Self> {
        conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
            .map_err(|e| VigilError::Transaction(e.to_string()))?;

        Ok(Self { conn, in_txn: true })
    }
}

impl<'a> TaskTxn for SqliteTaskTxn<'a> {
    fn insert_task(&mut self, task: &ManagedTask, auxdata: Option<&Value>) -> Result<()> {
        execute_task_statement(&self.conn, INSERT_TASK, task)?;

        if let Some(auxdata) = auxdata {
            self.conn
                .execute(
                    "INSERT INTO managed_task_auxdata (task_id, data) VALUES (?1, ?2)",
                    params![task.id.as_str(), serde_json::to_string(auxdata)?],
                )
                .map_err(store_err)?;
        }
        Ok(())
    }

    fn load_task(&mut self, id: &TaskId) -> Result<Option<ManagedTask>> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM managed_tasks WHERE id = ?1"),
                params![id.as_str()],
                task_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    fn update_task(&mut self, task: &ManagedTask) -> Result<()> {
        let changed = execute_task_statement(&self.conn, UPDATE_TASK, task)?;
        if changed == 0 {
            return Err(VigilError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    fn pending_ids_by_type(&mut self, task_type: &str) -> Result<Vec<TaskId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM managed_tasks WHERE task_type = ?1 AND finished IS NULL ORDER BY created ASC",
            )
            .map_err(store_err)?;
        let ids = stmt
            .query_map(params![task_type], |row| row.get::<_, String>(0))
            .map_err(store_err)?
            .map(|id| id.map(TaskId::from))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(ids)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.in_txn {
            self.conn
                .execute("COMMIT", [])
                .map_err(|e| VigilError::Transaction(e.to_string()))?;
            self.in_txn = false;
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        if self.in_txn {
            let _ = self.conn.execute("ROLLBACK", []);
            self.in_txn = false;
        }
    }
}

impl<'a> Drop for SqliteTaskTxn<'a> {
    fn drop(&mut self) {
        if self.in_txn {
            let _ = self.conn.execute("ROLLBACK", []);
        }
    }
}
