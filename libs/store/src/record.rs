//! Job record types persisted by the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::JobState;

/// Monotonically assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A job as submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Opaque resource descriptor, forwarded to the backend untouched.
    pub resources_descriptor: String,
}

impl NewJob {
    pub fn new(resources_descriptor: impl Into<String>) -> Self {
        Self {
            name: None,
            resources_descriptor: resources_descriptor.into(),
        }
    }

    pub fn named(name: impl Into<String>, resources_descriptor: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            resources_descriptor: resources_descriptor.into(),
        }
    }
}

/// Durable record of a managed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: Option<String>,
    pub state: JobState,
    pub resources_descriptor: String,
    pub submitted_at: DateTime<Utc>,
    pub state_updated_at: DateTime<Utc>,
    /// Set when the job entered a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Process id of the controller currently bound to this job.
    pub controller_pid: Option<u32>,
    pub retry_count: u32,
    /// Only populated in `Failed`.
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    /// Serialized backend cluster handle of the current launch.
    pub cluster_handle: Option<String>,
    /// The controller finished launching and waits for a run slot.
    pub launch_ready: bool,
    /// Earliest instant at which a re-queued job may be admitted again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Incremented on every write to the row.
    pub version: i64,
}

impl JobRecord {
    /// Wall-clock time between submission and the end of the job (or now).
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.submitted_at
    }
}

/// Side fields committed together with a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub(crate) to: JobState,
    pub(crate) retry_count: Option<u32>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) reason: Option<String>,
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
    pub(crate) clear_cluster: bool,
}

impl StateUpdate {
    /// Transition to `state` without touching any other field.
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            retry_count: None,
            failure_reason: None,
            reason: None,
            next_attempt_at: None,
            clear_cluster: false,
        }
    }

    /// Transition to `Failed`, recording why.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            failure_reason: Some(reason.clone()),
            reason: Some(reason),
            ..Self::to(JobState::Failed)
        }
    }

    pub fn target(&self) -> JobState {
        self.to
    }

    /// Set the new retry count. The store rejects decreases.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Not admissible again before `at`.
    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Free-form note stored in the transition history.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Forget the cluster handle (after teardown, or when it is stale).
    pub fn clear_cluster(mut self) -> Self {
        self.clear_cluster = true;
        self
    }
}

/// One entry of a job's transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: JobId,
    /// `None` for the initial insertion into `Pending`.
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The flag was set; the owner of the job will observe it.
    Requested,
    /// The flag was already set.
    AlreadyRequested,
    /// The job had already finished.
    AlreadyTerminal(JobState),
}
