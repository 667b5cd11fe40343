//! Purge command implementation

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

pub fn execute(db_path: &Path, older_than_days: u64) -> Result<()> {
    let scheduler = crate::open_scheduler(db_path)?;

    let removed = scheduler
        .purge_finished(Duration::from_secs(older_than_days * 24 * 3600))
        .context("Failed to purge finished tasks")?;

    if removed == 0 {
        println!("Nothing to purge");
    } else {
        println!("✓ Removed {} finished task(s)", removed);
    }
    Ok(())
}
