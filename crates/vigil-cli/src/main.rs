//! Vigil CLI - Command-line interface for inspecting and operating a task store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vigil_core::StoreConfig;
use vigil_scheduler::Scheduler;
use vigil_sqlite::SqliteTaskStore;

mod commands;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the task database file
    #[arg(short, long, env = "VIGIL_DB_PATH", default_value = "./vigil.db")]
    db_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task counts and schema version
    Status,

    /// List tasks
    List {
        /// Only tasks of this type
        #[arg(short = 't', long)]
        task_type: Option<String>,

        /// Hide finished tasks
        #[arg(short, long)]
        pending: bool,

        /// Only tasks created after this RFC 3339 instant
        #[arg(long)]
        created_after: Option<DateTime<Utc>>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show everything known about one task
    Describe {
        /// Task id
        id: String,

        /// Also print the task's auxiliary data
        #[arg(long)]
        auxdata: bool,
    },

    /// Make tasks eligible to run again
    Retry {
        /// Task ids to retry
        #[arg(required_unless_present = "task_type", conflicts_with = "task_type")]
        ids: Vec<String>,

        /// Retry every unfinished task of this type instead
        #[arg(short = 't', long)]
        task_type: Option<String>,
    },

    /// Request cancellation of tasks
    Cancel {
        /// Task ids to cancel
        #[arg(required = true)]
        ids: Vec<String>,

        /// Seconds to wait for executing tasks to acknowledge
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Delete finished tasks
    Purge {
        /// Keep tasks finished within this many days
        #[arg(long, default_value_t = 7)]
        older_than_days: u64,
    },
}

/// Open the store and build a scheduler without handlers.
///
/// Administrative commands never schedule, so no task types are registered.
/// Workers run in other processes, so waiting polls the store.
pub(crate) fn open_scheduler(db_path: &Path) -> Result<Scheduler> {
    let store = SqliteTaskStore::open(StoreConfig::new(db_path))
        .with_context(|| format!("Failed to open task store at {}", db_path.display()))?;
    Ok(Scheduler::builder(Arc::new(store))
        .with_polling_only()
        .with_poll_interval(Duration::from_millis(250))
        .build())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Status => {
            commands::status::execute(&cli.db_path)?;
        }
        Commands::List {
            task_type,
            pending,
            created_after,
            limit,
            json,
        } => {
            let filter = commands::list::filter(task_type, pending, created_after, limit);
            commands::list::execute(&cli.db_path, &filter, json)?;
        }
        Commands::Describe { id, auxdata } => {
            commands::describe::execute(&cli.db_path, id, auxdata)?;
        }
        Commands::Retry { ids, task_type } => {
            commands::retry::execute(&cli.db_path, ids, task_type)?;
        }
        Commands::Cancel { ids, wait } => {
            commands::cancel::execute(&cli.db_path, ids, wait)?;
        }
        Commands::Purge { older_than_days } => {
            commands::purge::execute(&cli.db_path, older_than_days)?;
        }
    }

    Ok(())
}
