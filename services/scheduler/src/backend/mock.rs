//! Scriptable in-memory backend for tests and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{Backend, BackendError, ClusterHandle, LaunchSpec, WorkloadStatus};

/// Mock backend.
///
/// Launch outcomes and status sequences can be scripted per resource
/// descriptor. Unscripted launches succeed; unscripted clusters follow the
/// default status script, whose last entry repeats forever.
pub struct MockBackend {
    state: Mutex<MockState>,
    counter: AtomicU64,
}

#[derive(Default)]
struct MockState {
    launch_outcomes: HashMap<String, VecDeque<Result<(), BackendError>>>,
    statuses: HashMap<String, VecDeque<WorkloadStatus>>,
    default_statuses: Vec<WorkloadStatus>,
    clusters: HashMap<String, MockCluster>,
    launches: HashMap<String, usize>,
    terminated: Vec<ClusterHandle>,
    terminate_error: Option<BackendError>,
}

struct MockCluster {
    descriptor: String,
    script: VecDeque<WorkloadStatus>,
}

impl MockBackend {
    /// Clusters run forever.
    pub fn new() -> Self {
        Self::with_default_statuses(vec![WorkloadStatus::Running])
    }

    /// Clusters report `Running` for `polls` polls, then `Succeeded`.
    pub fn completing_after(polls: usize) -> Self {
        let mut script = vec![WorkloadStatus::Running; polls];
        script.push(WorkloadStatus::Succeeded);
        Self::with_default_statuses(script)
    }

    fn with_default_statuses(default_statuses: Vec<WorkloadStatus>) -> Self {
        Self {
            state: Mutex::new(MockState {
                default_statuses,
                ..MockState::default()
            }),
            counter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Outcomes of the next launches for `descriptor`, in order.
    pub fn script_launches(&self, descriptor: &str, outcomes: Vec<Result<(), BackendError>>) {
        self.lock()
            .launch_outcomes
            .insert(descriptor.to_string(), outcomes.into());
    }

    /// Statuses reported by clusters of `descriptor`, consumed one per poll
    /// across launches. The last one repeats.
    pub fn script_statuses(&self, descriptor: &str, statuses: Vec<WorkloadStatus>) {
        self.lock()
            .statuses
            .insert(descriptor.to_string(), statuses.into());
    }

    /// Make every terminate call fail.
    pub fn fail_terminations(&self, error: BackendError) {
        self.lock().terminate_error = Some(error);
    }

    /// Number of launch attempts for `descriptor`.
    pub fn launch_attempts(&self, descriptor: &str) -> usize {
        self.lock().launches.get(descriptor).copied().unwrap_or(0)
    }

    /// Clusters torn down so far.
    pub fn terminated(&self) -> Vec<ClusterHandle> {
        self.lock().terminated.clone()
    }

    /// Clusters launched and not torn down.
    pub fn live_clusters(&self) -> usize {
        self.lock().clusters.len()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Front of a script; the last entry is never consumed.
fn next_status(script: &mut VecDeque<WorkloadStatus>) -> Option<WorkloadStatus> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ClusterHandle, BackendError> {
        info!(
            job_id = %spec.job_id,
            cluster = %spec.cluster_name,
            "[MOCK] Launching cluster"
        );

        let mut state = self.lock();
        *state.launches.entry(spec.descriptor.clone()).or_default() += 1;

        let outcome = state
            .launch_outcomes
            .get_mut(&spec.descriptor)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));
        outcome?;

        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = ClusterHandle {
            cluster_name: spec.cluster_name.clone(),
            backend_id: format!("mock-{counter:06}"),
            launched_at: Utc::now(),
        };
        let script = state.default_statuses.iter().cloned().collect();
        state.clusters.insert(
            handle.backend_id.clone(),
            MockCluster {
                descriptor: spec.descriptor.clone(),
                script,
            },
        );

        debug!(backend_id = %handle.backend_id, "[MOCK] Cluster up");
        Ok(handle)
    }

    async fn poll_status(&self, handle: &ClusterHandle) -> WorkloadStatus {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(cluster) = state.clusters.get_mut(&handle.backend_id) else {
            return WorkloadStatus::Unreachable;
        };

        let scripted = state
            .statuses
            .get_mut(&cluster.descriptor)
            .and_then(next_status);
        scripted
            .or_else(|| next_status(&mut cluster.script))
            .unwrap_or(WorkloadStatus::Running)
    }

    async fn terminate(&self, handle: &ClusterHandle) -> Result<(), BackendError> {
        info!(
            cluster = %handle.cluster_name,
            backend_id = %handle.backend_id,
            "[MOCK] Terminating cluster"
        );

        let mut state = self.lock();
        if let Some(error) = state.terminate_error.clone() {
            return Err(error);
        }
        state.clusters.remove(&handle.backend_id);
        state.terminated.push(handle.clone());
        Ok(())
    }
}
