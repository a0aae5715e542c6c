//! Status command - Show one job and its transition history.

use anyhow::Result;
use clap::Args;
use mjobs_store::{JobId, JobRecord, JobTransition, StoreError};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::error::CliError;
use crate::output::{
    display_option, format_duration, format_timestamp, print_single, OutputFormat,
};

use super::CommandContext;

/// Show a job.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Job id.
    job_id: JobId,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    job: JobRecord,
    history: Vec<JobTransition>,
}

#[derive(Debug, Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: &'static str,

    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Debug, Tabled)]
struct HistoryRow {
    #[tabled(rename = "At")]
    at: String,

    #[tabled(rename = "From")]
    from: String,

    #[tabled(rename = "To")]
    to: String,

    #[tabled(rename = "Reason", display = "display_option")]
    reason: Option<String>,
}

impl From<&JobTransition> for HistoryRow {
    fn from(t: &JobTransition) -> Self {
        Self {
            at: format_timestamp(&t.at),
            from: t.from_state.map_or_else(|| "-".to_string(), |s| s.to_string()),
            to: t.to_state.to_string(),
            reason: t.reason.clone(),
        }
    }
}

fn field_rows(job: &JobRecord) -> Vec<FieldRow> {
    let mut rows = vec![
        FieldRow { field: "ID", value: job.job_id.to_string() },
        FieldRow { field: "Name", value: display_option(&job.name) },
        FieldRow { field: "Status", value: job.state.as_str().to_uppercase() },
        FieldRow { field: "Resources", value: job.resources_descriptor.clone() },
        FieldRow { field: "Submitted", value: format_timestamp(&job.submitted_at) },
        FieldRow { field: "Duration", value: format_duration(job.duration()) },
        FieldRow { field: "Retries", value: job.retry_count.to_string() },
    ];
    if let Some(ended_at) = &job.ended_at {
        rows.push(FieldRow { field: "Ended", value: format_timestamp(ended_at) });
    }
    if let Some(reason) = &job.failure_reason {
        rows.push(FieldRow { field: "Failure", value: reason.clone() });
    }
    if job.cancel_requested && !job.state.is_terminal() {
        rows.push(FieldRow { field: "Cancel", value: "requested".to_string() });
    }
    if let Some(pid) = job.controller_pid {
        rows.push(FieldRow { field: "Controller PID", value: pid.to_string() });
    }
    if let Some(at) = &job.next_attempt_at {
        if !job.state.is_terminal() {
            rows.push(FieldRow { field: "Next attempt", value: format_timestamp(at) });
        }
    }
    rows
}

impl StatusCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let store = ctx.store()?;
        let job = store.get(self.job_id).map_err(|e| match e {
            StoreError::NotFound(id) => CliError::NotFound(id.to_string()).into(),
            other => anyhow::Error::from(other),
        })?;
        let history = store.history(self.job_id)?;

        match ctx.format {
            OutputFormat::Table => {
                println!("{}", Table::new(field_rows(&job)));
                println!();
                let rows: Vec<HistoryRow> = history.iter().map(HistoryRow::from).collect();
                println!("{}", Table::new(rows));
            }
            OutputFormat::Json => print_single(&StatusResponse { job, history }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mjobs_store::{JobState, JobStore, NewJob, StateUpdate};

    fn value_of<'a>(rows: &'a [FieldRow], field: &str) -> Option<&'a str> {
        rows.iter().find(|r| r.field == field).map(|r| r.value.as_str())
    }

    #[test]
    fn failed_job_shows_reason_and_end() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = store.create(&NewJob::named("train", "python train.py")).unwrap();
        store
            .update_state(job_id, JobState::Pending, JobState::Launching)
            .unwrap();
        store
            .transition(job_id, JobState::Launching, StateUpdate::failed("quota exceeded"))
            .unwrap();

        let rows = field_rows(&store.get(job_id).unwrap());
        assert_eq!(value_of(&rows, "Status"), Some("FAILED"));
        assert_eq!(value_of(&rows, "Name"), Some("train"));
        assert_eq!(value_of(&rows, "Failure"), Some("quota exceeded"));
        assert!(value_of(&rows, "Ended").is_some());
        assert!(value_of(&rows, "Cancel").is_none());
    }

    #[test]
    fn history_row_of_submission_has_no_source_state() {
        let store = JobStore::open_in_memory().unwrap();
        let job_id = store.create(&NewJob::new("sleep 5")).unwrap();

        let history = store.history(job_id).unwrap();
        let row = HistoryRow::from(&history[0]);
        assert_eq!(row.from, "-");
        assert_eq!(row.to, "pending");
    }
}
