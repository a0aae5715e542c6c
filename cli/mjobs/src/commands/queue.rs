//! Queue command - List jobs, oldest first.

use anyhow::Result;
use clap::Args;
use mjobs_store::{JobId, JobRecord, JobStore};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    display_option, format_duration, format_timestamp, print_output, print_single, OutputFormat,
};

use super::CommandContext;

/// List jobs.
#[derive(Debug, Args)]
pub struct QueueCommand {
    /// Hide succeeded, failed and cancelled jobs.
    #[arg(long, short)]
    skip_finished: bool,

    /// Only jobs with this name.
    #[arg(long, short)]
    name: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "ID")]
    job_id: JobId,

    #[tabled(rename = "Name", display = "display_option")]
    name: Option<String>,

    #[tabled(rename = "Resources")]
    resources: String,

    #[tabled(rename = "Submitted")]
    submitted_at: String,

    #[tabled(rename = "Duration")]
    duration: String,

    #[tabled(rename = "#Retries")]
    retry_count: u32,

    #[tabled(rename = "Status")]
    status: String,
}

const MAX_RESOURCES_WIDTH: usize = 40;

impl From<&JobRecord> for QueueRow {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.job_id,
            name: job.name.clone(),
            resources: truncate(&job.resources_descriptor, MAX_RESOURCES_WIDTH),
            submitted_at: format_timestamp(&job.submitted_at),
            duration: format_duration(job.duration()),
            retry_count: job.retry_count,
            status: job.state.as_str().to_uppercase(),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn select_jobs(
    store: &JobStore,
    skip_finished: bool,
    name: Option<&str>,
) -> Result<Vec<JobRecord>> {
    let Some(name) = name else {
        return Ok(store.list(skip_finished)?);
    };
    let mut jobs = store.find_by_name(name)?;
    if skip_finished {
        jobs.retain(|job| !job.state.is_terminal());
    }
    Ok(jobs)
}

impl QueueCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.store()?;
        let jobs = select_jobs(&store, self.skip_finished, self.name.as_deref())?;

        match ctx.format {
            OutputFormat::Table => {
                let rows: Vec<QueueRow> = jobs.iter().map(QueueRow::from).collect();
                print_output(&rows, ctx.format);
            }
            OutputFormat::Json => print_single(&jobs),
        }
        Ok(())
    }
}
