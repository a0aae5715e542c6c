//! Durable job record store for the managed-jobs scheduler.
//!
//! One row per job, shared by the scheduler loop, every job controller and
//! the CLI. All state changes are compare-and-swap transitions validated
//! against the lifecycle of [`JobState`], and every committed transition is
//! appended to a per-job history.

mod error;
mod record;
mod state;
mod store;

pub use error::StoreError;
pub use record::{CancelOutcome, JobId, JobRecord, JobTransition, NewJob, StateUpdate};
pub use state::{JobState, ParseStateError};
pub use store::{default_data_dir, JobStore, DB_FILE_NAME};
