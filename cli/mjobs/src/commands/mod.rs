//! CLI commands.

mod cancel;
mod queue;
mod status;
mod submit;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mjobs_store::{default_data_dir, JobStore};

use crate::output::OutputFormat;

/// mjobs CLI - Submit and manage long-running jobs.
#[derive(Debug, Parser)]
#[command(name = "mjobs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table", value_parser = ["table", "json"])]
    format: String,

    /// Directory holding the job store.
    #[arg(long, global = true, env = "MJOBS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a job.
    Submit(submit::SubmitCommand),

    /// Cancel jobs by id, by name, or all of them.
    Cancel(cancel::CancelCommand),

    /// Show one job and its state history.
    Status(status::StatusCommand),

    /// List jobs.
    Queue(queue::QueueCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let ctx = CommandContext { data_dir, format };

        match self.command {
            Commands::Submit(cmd) => cmd.run(ctx),
            Commands::Cancel(cmd) => cmd.run(ctx),
            Commands::Status(cmd) => cmd.run(ctx),
            Commands::Queue(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("mjobs {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub data_dir: PathBuf,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Open the job store under the data directory.
    pub fn store(&self) -> Result<JobStore> {
        JobStore::open_in_dir(&self.data_dir).with_context(|| {
            format!("Failed to open job store in {}", self.data_dir.display())
        })
    }
}
