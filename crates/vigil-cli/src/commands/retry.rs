//! Retry command implementation

use anyhow::{Context, Result};
use std::path::Path;
use vigil_core::TaskId;
use vigil_scheduler::RetryTarget;

pub fn execute(db_path: &Path, ids: Vec<String>, task_type: Option<String>) -> Result<()> {
    let scheduler = crate::open_scheduler(db_path)?;

    let targets: Vec<RetryTarget> = match task_type {
        Some(task_type) => vec![RetryTarget::Type(task_type)],
        None => ids.into_iter().map(|id| TaskId::from(id).into()).collect(),
    };

    let mut work = scheduler.begin_work()?;
    let mut retried = 0;
    for target in targets {
        retried += work.retry_task(target).context("Failed to retry")?;
    }
    work.commit().context("Failed to commit retry")?;

    println!("✓ {} task(s) rescheduled", retried);
    Ok(())
}
