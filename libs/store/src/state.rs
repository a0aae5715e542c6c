//! Managed job lifecycle states and the legal transitions between them.
//!
//! ```text
//!                 +-----------------------------+
//!                 v                             |
//! pending ---> launching ---> running ---> recovering
//!                 |              |              |
//!                 +--> failed <--+--------------+
//!                                |
//!                                +--> succeeded
//!
//! any non-terminal state ---> cancelling ---> cancelled
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a launch slot.
    Pending,
    /// Holding a launch slot; the controller is provisioning the cluster.
    Launching,
    /// Holding a run slot; the controller is monitoring the workload.
    Running,
    /// The cluster was lost; waiting to be re-admitted for a new launch.
    Recovering,
    /// User cancellation in progress; cluster teardown is best-effort.
    Cancelling,
    /// Workload finished successfully.
    Succeeded,
    /// Job failed; `failure_reason` is always set.
    Failed,
    /// Job was cancelled by the user.
    Cancelled,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 8] = [
        JobState::Pending,
        JobState::Launching,
        JobState::Running,
        JobState::Recovering,
        JobState::Cancelling,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// States in which a controller is expected to be alive for the job.
    pub const CONTROLLER_OWNED: [JobState; 3] = [
        JobState::Launching,
        JobState::Running,
        JobState::Cancelling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true if no transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a controller should be driving a job in this state.
    pub fn is_controller_owned(&self) -> bool {
        Self::CONTROLLER_OWNED.contains(self)
    }

    /// Returns true if a job in this state waits in the admission queue.
    pub fn is_admissible(&self) -> bool {
        matches!(self, Self::Pending | Self::Recovering)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Pending, Launching) => true,
            (Launching, Running | Pending | Failed) => true,
            (Running, Recovering | Succeeded | Failed) => true,
            (Recovering, Launching | Failed) => true,
            (Cancelling, Cancelled) => true,
            (from, Cancelling) => !from.is_terminal() && *from != Cancelling,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "launching" => Ok(Self::Launching),
            "running" => Ok(Self::Running),
            "recovering" => Ok(Self::Recovering),
            "cancelling" => Ok(Self::Cancelling),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}
