//! Status command implementation

use anyhow::{Context, Result};
use std::path::Path;

pub fn execute(db_path: &Path) -> Result<()> {
    tracing::info!("Checking task store status: {}", db_path.display());

    let scheduler = crate::open_scheduler(db_path)?;
    let stats = scheduler.stats().context("Failed to read task counts")?;

    println!("\nTask Store Status");
    println!("{}", "=".repeat(60));
    println!("Path: {}", db_path.display());
    println!("Schema Version: {}", stats.schema_version);

    println!("\nTasks:");
    println!("  Pending:   {}", stats.pending);
    println!("  Executing: {}", stats.executing);
    println!("  Completed: {}", stats.completed);
    println!("  Failed:    {}", stats.failed);
    println!("  Cancelled: {}", stats.cancelled);

    if stats.failed > 0 {
        println!("\n⚠️  {} task(s) failed permanently", stats.failed);
        println!("Run 'vigil list' to inspect them");
    } else if stats.pending == 0 && stats.executing == 0 {
        println!("\n✓ No outstanding work");
    }

    Ok(())
}
