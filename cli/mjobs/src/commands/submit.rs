//! Submit command.

use anyhow::{Context, Result};
use clap::Args;
use mjobs_store::{JobId, NewJob};
use serde::Serialize;

use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Submit a job to the queue.
#[derive(Debug, Args)]
pub struct SubmitCommand {
    /// Resource descriptor handed to the backend (for the local backend, a shell command).
    descriptor: String,

    /// Human-readable job name.
    #[arg(long, short)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitReceipt {
    job_id: JobId,
    name: Option<String>,
    state: &'static str,
}

impl SubmitCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.store()?;
        let job = match self.name.clone() {
            Some(name) => NewJob::named(name, self.descriptor),
            None => NewJob::new(self.descriptor),
        };
        let job_id = store.create(&job).context("Failed to submit job")?;

        match ctx.format {
            OutputFormat::Table => {
                let label = match &self.name {
                    Some(name) => format!("Submitted job {job_id} ({name})"),
                    None => format!("Submitted job {job_id}"),
                };
                print_success(&label);
                print_info(&format!("Follow it with: mjobs status {job_id}"));
            }
            OutputFormat::Json => print_single(&SubmitReceipt {
                job_id,
                name: self.name,
                state: "pending",
            }),
        }
        Ok(())
    }
}
