//! Shared harness for scheduler integration tests.
//!
//! Controllers run in-process against a [`MockBackend`]; the harness drives
//! the scheduler tick by tick so tests can check invariants between ticks.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mjobs_scheduler::backend::{Backend, MockBackend, PassthroughRenderer};
use mjobs_scheduler::backoff::BackoffPolicy;
use mjobs_scheduler::spawner::{ControllerLauncher, LivenessProbe, TaskLauncher};
use mjobs_scheduler::{
    AdmissionController, ControllerSettings, RecoveryManager, Scheduler, SchedulerConfig,
    SlotBudget,
};
use mjobs_store::{JobId, JobState, JobStore, NewJob};

/// Probe with a fixed set of live pids.
pub struct FixedProbe(pub HashSet<u32>);

impl LivenessProbe for FixedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }
}

pub fn settings(max_retries: u32) -> ControllerSettings {
    ControllerSettings {
        max_retries,
        backoff: BackoffPolicy::none(),
        poll_interval: Duration::from_millis(5),
    }
}

/// In-process controllers driving `backend`.
pub fn task_launcher(store: &Arc<JobStore>, backend: &Arc<MockBackend>, max_retries: u32) -> TaskLauncher {
    TaskLauncher::new(
        Arc::clone(store),
        Arc::clone(backend) as Arc<dyn Backend>,
        Arc::new(PassthroughRenderer),
        settings(max_retries),
    )
}

pub struct Harness {
    pub store: Arc<JobStore>,
    pub backend: Arc<MockBackend>,
    pub admission: Arc<AdmissionController>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new(budget: SlotBudget, max_retries: u32) -> Self {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        Self::with_store(store, budget, max_retries, &[])
    }

    /// Build a scheduler over an existing store, as after a restart.
    pub fn with_store(
        store: Arc<JobStore>,
        budget: SlotBudget,
        max_retries: u32,
        live_pids: &[u32],
    ) -> Self {
        let backend = Arc::new(MockBackend::new());
        let launcher = Arc::new(task_launcher(&store, &backend, max_retries));
        Self::with_launcher(store, backend, launcher, budget, max_retries, live_pids)
    }

    /// Build a scheduler that starts controllers through `launcher`.
    pub fn with_launcher(
        store: Arc<JobStore>,
        backend: Arc<MockBackend>,
        launcher: Arc<dyn ControllerLauncher>,
        budget: SlotBudget,
        max_retries: u32,
        live_pids: &[u32],
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(Arc::clone(&store), budget).unwrap());
        let recovery = RecoveryManager::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            Arc::new(FixedProbe(live_pids.iter().copied().collect())),
            settings(max_retries),
        );
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            recovery,
            launcher,
            SchedulerConfig {
                schedule_interval: Duration::from_millis(5),
                recovery_interval: Duration::from_secs(60),
            },
        );

        Self {
            store,
            backend,
            admission,
            scheduler,
        }
    }

    pub fn submit(&self, descriptor: &str) -> JobId {
        self.store.create(&NewJob::new(descriptor)).unwrap()
    }

    pub fn state(&self, job_id: JobId) -> JobState {
        self.store.get(job_id).unwrap().state
    }

    pub fn count(&self, state: JobState) -> usize {
        self.store.count_by_state(state).unwrap()
    }

    /// Tick until `done` holds, running `check` after every tick.
    pub async fn run_checked<D, C>(&mut self, done: D, check: C) -> bool
    where
        D: Fn(&Harness) -> bool,
        C: Fn(&Harness),
    {
        for _ in 0..2_000 {
            self.scheduler.tick().unwrap();
            check(self);
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    pub async fn run_until<D>(&mut self, done: D) -> bool
    where
        D: Fn(&Harness) -> bool,
    {
        self.run_checked(done, |_| {}).await
    }

    /// States the job went through, oldest first.
    pub fn path(&self, job_id: JobId) -> Vec<JobState> {
        self.store
            .history(job_id)
            .unwrap()
            .into_iter()
            .map(|t| t.to_state)
            .collect()
    }

    /// Every recorded step is a legal transition and nothing follows a
    /// terminal state.
    pub fn assert_valid_path(&self, job_id: JobId) {
        let path = self.path(job_id);
        assert_eq!(path.first(), Some(&JobState::Pending));
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "job {job_id}: illegal step {} -> {} in {path:?}",
                pair[0],
                pair[1]
            );
        }
    }
}
