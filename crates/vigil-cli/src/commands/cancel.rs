//! Cancel command implementation

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use vigil_core::TaskId;
use vigil_scheduler::CancelHandle;

pub fn execute(db_path: &Path, ids: Vec<String>, wait: Option<u64>) -> Result<()> {
    let scheduler = crate::open_scheduler(db_path)?;
    let ids: Vec<TaskId> = ids.into_iter().map(TaskId::from).collect();

    let mut work = scheduler.begin_work()?;
    let handle = work.cancel_tasks(&ids).context("Failed to cancel")?;
    work.commit().context("Failed to commit cancellation")?;

    for line in summary(&handle) {
        println!("{}", line);
    }
    let Some(secs) = wait.filter(|_| !handle.is_immediate()) else {
        return Ok(());
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(handle.tasks_cancelled(Some(Duration::from_secs(secs))))
        .context("Executing tasks did not stop in time")?;
    println!("✓ All executing tasks stopped");

    Ok(())
}

/// One line per kind of outcome, counting only the tasks it applies to.
fn summary(handle: &CancelHandle) -> Vec<String> {
    let mut lines = vec![format!(
        "✓ Cancelled {} idle task(s)",
        handle.cancelled_now().len()
    )];

    let finished = handle.already_finished().len();
    if finished > 0 {
        lines.push(format!("{} task(s) already finished, left unchanged", finished));
    }

    let executing = handle.awaiting_ack().len();
    if executing > 0 {
        lines.push(format!(
            "{} task(s) executing, cancellation requested",
            executing
        ));
    }
    lines
}
