//! Cancel command.
//!
//! Cancellation only raises a flag on the job record; the controller that
//! owns the job (or the scheduler, for queued jobs) settles it.

use anyhow::Result;
use clap::{ArgGroup, Args};
use mjobs_store::{CancelOutcome, JobId, JobStore, StoreError};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_output, print_warning, OutputFormat};

use super::CommandContext;

/// Cancel jobs. Exactly one of job ids, `--name` or `--all` is required.
#[derive(Debug, Args)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["job_ids", "name", "all"]),
))]
pub struct CancelCommand {
    /// Job ids to cancel.
    job_ids: Vec<JobId>,

    /// Cancel the unfinished job with this name.
    #[arg(long, short)]
    name: Option<String>,

    /// Cancel every unfinished job.
    #[arg(long, short)]
    all: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct CancelRow {
    #[tabled(rename = "ID")]
    job_id: JobId,

    #[tabled(rename = "Result")]
    outcome: String,
}

impl CancelRow {
    fn new(job_id: JobId, outcome: CancelOutcome) -> Self {
        let outcome = match outcome {
            CancelOutcome::Requested => "cancellation requested".to_string(),
            CancelOutcome::AlreadyRequested => "already cancelling".to_string(),
            CancelOutcome::AlreadyTerminal(state) => format!("already {state}"),
        };
        Self { job_id, outcome }
    }
}

impl CancelCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.store()?;

        let rows = if self.all {
            store
                .request_cancel_all()?
                .into_iter()
                .map(|job_id| CancelRow::new(job_id, CancelOutcome::Requested))
                .collect()
        } else if let Some(name) = self.name.as_deref() {
            let (job_id, outcome) = store.request_cancel_by_name(name)?;
            vec![CancelRow::new(job_id, outcome)]
        } else {
            return cancel_ids(&store, &self.job_ids, ctx.format);
        };

        if self.all && rows.is_empty() && ctx.format == OutputFormat::Table {
            print_warning("No unfinished jobs to cancel.");
            return Ok(());
        }
        print_output(&rows, ctx.format);
        Ok(())
    }
}

fn cancel_ids(store: &JobStore, job_ids: &[JobId], format: OutputFormat) -> Result<()> {
    let mut rows = Vec::with_capacity(job_ids.len());
    let mut missing = Vec::new();

    for job_id in job_ids {
        match store.request_cancel(*job_id) {
            Ok(outcome) => rows.push(CancelRow::new(*job_id, outcome)),
            Err(StoreError::NotFound(id)) => missing.push(id.to_string()),
            Err(e) => return Err(e.into()),
        }
    }

    if !rows.is_empty() {
        print_output(&rows, format);
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CliError::NotFound(missing.join(", ")).into())
    }
}
