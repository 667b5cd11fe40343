//! List command implementation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use vigil_core::TaskFilter;
use vigil_scheduler::TaskDescription;

/// Build the store filter from the command-line flags.
pub fn filter(
    task_type: Option<String>,
    pending: bool,
    created_after: Option<DateTime<Utc>>,
    limit: usize,
) -> TaskFilter {
    let mut filter = TaskFilter::new().only_pending(pending).limit(limit);
    if let Some(task_type) = task_type {
        filter = filter.task_type(task_type);
    }
    if let Some(after) = created_after {
        filter = filter.created_after(after);
    }
    filter
}

pub fn execute(db_path: &Path, filter: &TaskFilter, json: bool) -> Result<()> {
    let scheduler = crate::open_scheduler(db_path)?;
    let tasks = scheduler.list_tasks(filter).context("Failed to list tasks")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<16}  {:>8}  NEXT ATTEMPT",
        "ID", "TYPE", "STATUS", "FAILURES"
    );
    println!("{}", "-".repeat(110));
    for task in &tasks {
        print_row(task);
    }
    println!("\n{} task(s)", tasks.len());

    Ok(())
}

fn print_row(task: &TaskDescription) {
    let next = task
        .next_attempt
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<36}  {:<24}  {:<16}  {:>8}  {}",
        task.id,
        task.task_type,
        task.status.as_str(),
        task.failures,
        next
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_flags() {
        let after = Utc::now();
        let f = filter(Some("mail:send".into()), true, Some(after), 5);
        assert_eq!(f.task_type.as_deref(), Some("mail:send"));
        assert!(f.only_pending);
        assert_eq!(f.created_after, Some(after));
        assert_eq!(f.limit, Some(5));
    }
}
