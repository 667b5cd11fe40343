//! Mapping between `ManagedTask` and `managed_tasks` rows.
//!
//! Instants are stored as Unix milliseconds, payloads as JSON text.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{named_params, Connection, Row};
use serde_json::Value;
use vigil_core::error::{Result, VigilError};
use vigil_core::types::{FailureKind, Lease, ManagedTask, TaskResult};

/// Column list matching [`task_from_row`]
pub(crate) const TASK_COLUMNS: &str = "id, task_type, task_data, created, not_before, next_attempt, \
     failures, last_errors, failure_kind, last_data, finished, result, cancelled, timeout_ms, \
     lease_token, lease_owner, lease_expires, has_auxdata";

pub(crate) const INSERT_TASK: &str = "INSERT INTO managed_tasks (id, task_type, task_data, created, not_before, next_attempt, \
     failures, last_errors, failure_kind, last_data, finished, result, cancelled, timeout_ms, \
     lease_token, lease_owner, lease_expires, has_auxdata) \
     VALUES (:id, :task_type, :task_data, :created, :not_before, :next_attempt, \
     :failures, :last_errors, :failure_kind, :last_data, :finished, :result, :cancelled, :timeout_ms, \
     :lease_token, :lease_owner, :lease_expires, :has_auxdata)";

pub(crate) const UPDATE_TASK: &str = "UPDATE managed_tasks SET task_type = :task_type, task_data = :task_data, \
     created = :created, not_before = :not_before, next_attempt = :next_attempt, failures = :failures, \
     last_errors = :last_errors, failure_kind = :failure_kind, last_data = :last_data, \
     finished = :finished, result = :result, cancelled = :cancelled, timeout_ms = :timeout_ms, \
     lease_token = :lease_token, lease_owner = :lease_owner, lease_expires = :lease_expires, \
     has_auxdata = :has_auxdata \
     WHERE id = :id";

pub(crate) fn store_err(err: rusqlite::Error) -> VigilError {
    VigilError::Store(err.to_string())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Execute `INSERT_TASK` or `UPDATE_TASK` with the task's column values
pub(crate) fn execute_task_statement(conn: &Connection, sql: &str, task: &ManagedTask) -> Result<usize> {
    let task_data = serde_json::to_string(&task.task_data)?;
    let last_data = task.last_data.as_ref().map(serde_json::to_string).transpose()?;
    let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
    let (lease_token, lease_owner, lease_expires) = match &task.lease {
        Some(lease) => (
            Some(lease.token.as_str()),
            Some(lease.owner.as_str()),
            Some(to_millis(lease.expires)),
        ),
        None => (None, None, None),
    };

    conn.execute(
        sql,
        named_params! {
            ":id": task.id.as_str(),
            ":task_type": task.task_type,
            ":task_data": task_data,
            ":created": to_millis(task.created),
            ":not_before": to_millis(task.not_before),
            ":next_attempt": task.next_attempt.map(to_millis),
            ":failures": task.failures as i64,
            ":last_errors": task.last_errors,
            ":failure_kind": task.failure_kind.map(|k| k.as_str()),
            ":last_data": last_data,
            ":finished": task.finished.map(to_millis),
            ":result": result,
            ":cancelled": task.cancelled.map(to_millis),
            ":timeout_ms": task.timeout_ms.map(|ms| ms as i64),
            ":lease_token": lease_token,
            ":lease_owner": lease_owner,
            ":lease_expires": lease_expires,
            ":has_auxdata": task.has_auxdata,
        },
    )
    .map_err(store_err)
}

fn conversion_err<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, Type::Text, e))
}

fn opt_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| conversion_err(idx, Type::Text, e)),
        None => Ok(None),
    }
}

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ManagedTask> {
    let failure_kind = match row.get::<_, Option<String>>(8)? {
        Some(kind) => Some(
            kind.parse::<FailureKind>()
                .map_err(|e| conversion_err(8, Type::Text, e))?,
        ),
        None => None,
    };

    let lease = match row.get::<_, Option<String>>(14)? {
        Some(token) => Some(Lease {
            token,
            owner: row.get(15)?,
            expires: time_column(row, 16)?,
        }),
        None => None,
    };

    Ok(ManagedTask {
        id: row.get::<_, String>(0)?.into(),
        task_type: row.get(1)?,
        task_data: json_column(row, 2)?,
        created: time_column(row, 3)?,
        not_before: time_column(row, 4)?,
        next_attempt: opt_time_column(row, 5)?,
        failures: row.get::<_, i64>(6)? as u32,
        last_errors: row.get(7)?,
        failure_kind,
        last_data: opt_json_column::<Value>(row, 9)?,
        finished: opt_time_column(row, 10)?,
        result: opt_json_column::<TaskResult>(row, 11)?,
        cancelled: opt_time_column(row, 12)?,
        timeout_ms: row.get::<_, Option<i64>>(13)?.map(|ms| ms as u64),
        lease,
        has_auxdata: row.get(17)?,
    })
}
