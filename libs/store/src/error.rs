//! Store error types.

use thiserror::Error;

use crate::record::JobId;
use crate::state::JobState;

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Compare-and-swap lost: another actor already moved the record.
    #[error("stale state for job {job_id}: expected {expected}, found {actual}")]
    StaleState {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("multiple jobs found with name {name:?}: {ids:?}")]
    AmbiguousName { name: String, ids: Vec<JobId> },

    #[error("no job found with name {0:?}")]
    NameNotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("could not determine a data directory")]
    NoDataDir,
}

impl StoreError {
    /// Returns true if the error means a compare-and-swap was lost.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleState { .. })
    }
}
