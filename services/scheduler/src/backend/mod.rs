//! Cluster backend contract.
//!
//! Controllers provision, observe and tear down clusters only through
//! [`Backend`]. Provisioning, pricing and remote execution live behind it;
//! the scheduler itself never calls a backend.
//!
//! A mock implementation is provided for testing and development, and a
//! local implementation that runs each job as a shell command on the host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mjobs_store::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BackendKind;

pub mod local;
pub mod mock;

pub use local::LocalBackend;
pub use mock::MockBackend;

/// Everything a backend needs to provision a job's cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub job_id: JobId,
    pub cluster_name: String,
    /// The job's resource descriptor, as submitted.
    pub descriptor: String,
    /// Rendered task to run on the cluster.
    pub command: String,
}

/// Handle to a provisioned cluster.
///
/// Persisted as JSON in the job record so a later controller can tear the
/// cluster down after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub cluster_name: String,
    pub backend_id: String,
    pub launched_at: DateTime<Utc>,
}

impl ClusterHandle {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Workload status as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Running,
    Succeeded,
    Failed(String),
    /// The cluster cannot be reached (preempted, crashed or unknown).
    Unreachable,
}

/// Backend errors, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Transient: capacity, quota or network trouble.
    #[error("retryable backend error: {0}")]
    Retryable(String),

    #[error("non-retryable backend error: {0}")]
    NonRetryable(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Cluster backend interface.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provision a cluster and start the job's task on it.
    async fn launch(&self, spec: &LaunchSpec) -> Result<ClusterHandle, BackendError>;

    /// Observe the workload on a cluster.
    async fn poll_status(&self, handle: &ClusterHandle) -> WorkloadStatus;

    /// Tear a cluster down.
    async fn terminate(&self, handle: &ClusterHandle) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template render failed: {0}")]
pub struct RenderError(pub String);

/// Turns a resource descriptor into a launch spec.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, job_id: JobId, descriptor: &str) -> Result<LaunchSpec, RenderError>;
}

/// Uses the descriptor itself as the task command.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl TemplateRenderer for PassthroughRenderer {
    fn render(&self, job_id: JobId, descriptor: &str) -> Result<LaunchSpec, RenderError> {
        let command = descriptor.trim();
        if command.is_empty() {
            return Err(RenderError("empty resource descriptor".to_string()));
        }

        Ok(LaunchSpec {
            job_id,
            cluster_name: cluster_name(job_id),
            descriptor: descriptor.to_string(),
            command: command.to_string(),
        })
    }
}

/// Cluster name owned by a job.
pub fn cluster_name(job_id: JobId) -> String {
    format!("mjobs-{job_id}")
}

/// Build the configured backend.
pub fn build(kind: BackendKind, workload_log_dir: PathBuf) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Local => Arc::new(LocalBackend::new().with_log_dir(workload_log_dir)),
        BackendKind::Mock => Arc::new(MockBackend::completing_after(3)),
    }
}
