//! Describe command implementation

use anyhow::{Context, Result};
use std::path::Path;
use vigil_core::TaskId;

pub fn execute(db_path: &Path, id: String, auxdata: bool) -> Result<()> {
    let scheduler = crate::open_scheduler(db_path)?;
    let id = TaskId::from(id);

    let task = scheduler
        .describe_task(&id)
        .with_context(|| format!("Failed to describe task {id}"))?;
    println!("{}", serde_json::to_string_pretty(&task)?);

    if auxdata {
        match scheduler.task_auxdata(&id)? {
            Some(aux) => println!("\nAuxdata:\n{}", serde_json::to_string_pretty(&aux)?),
            None => println!("\nNo auxdata"),
        }
    }

    Ok(())
}
