//! Recovery of jobs whose controller is gone.
//!
//! A job in a controller-owned state with no live controller is an orphan:
//! its controller crashed, or the host running the scheduler went down.
//! Orphans re-enter the admission queue through the same acquire path as
//! new jobs, counting the lost attempt against the retry ceiling.

use std::collections::HashSet;
use std::sync::Arc;

use mjobs_store::{JobId, JobRecord, JobState, JobStore, StateUpdate, StoreError};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::controller::{ControllerSettings, RECOVERY_CEILING_EXCEEDED};
use crate::spawner::LivenessProbe;

/// What recovery did with an orphaned job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanOutcome {
    /// Back in the admission queue (`Pending` or `Recovering`).
    Requeued(JobState),
    /// Retry ceiling exceeded.
    Failed,
    /// Cancellation in progress; a controller must finish the teardown.
    NeedsController,
    /// Someone else moved the job first, or it needs nothing.
    Untouched,
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Alive controllers not started by this scheduler.
    pub adopted: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Cancelling jobs that need a new controller.
    pub respawn: Vec<JobId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.adopted == 0 && self.requeued == 0 && self.failed == 0 && self.respawn.is_empty()
    }
}

pub struct RecoveryManager {
    store: Arc<JobStore>,
    admission: Arc<AdmissionController>,
    probe: Arc<dyn LivenessProbe>,
    settings: ControllerSettings,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<JobStore>,
        admission: Arc<AdmissionController>,
        probe: Arc<dyn LivenessProbe>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            admission,
            probe,
            settings,
        }
    }

    /// Sweep controller-owned jobs, skipping those whose controller is
    /// tracked by the caller.
    pub fn sweep(&self, tracked: &HashSet<JobId>) -> Result<RecoveryReport, StoreError> {
        let own_pid = std::process::id();
        let mut report = RecoveryReport::default();

        for state in JobState::CONTROLLER_OWNED {
            for record in self.store.list_by_state(state)? {
                report.scanned += 1;
                if tracked.contains(&record.job_id) {
                    continue;
                }

                // Our own pid on an untracked job is a leftover from an
                // earlier scheduler that ran controllers in-process.
                if let Some(pid) = record.controller_pid {
                    if pid != own_pid && self.probe.is_alive(pid) {
                        debug!(job_id = %record.job_id, pid, "Adopting live controller");
                        report.adopted += 1;
                        continue;
                    }
                }

                match self.recover_orphan(&record)? {
                    OrphanOutcome::Requeued(_) => report.requeued += 1,
                    OrphanOutcome::Failed => report.failed += 1,
                    OrphanOutcome::NeedsController => report.respawn.push(record.job_id),
                    OrphanOutcome::Untouched => {}
                }
            }
        }

        self.admission.refresh()?;
        Ok(report)
    }

    /// Re-queue or fail a job whose controller is known to be gone.
    pub fn recover_orphan(&self, record: &JobRecord) -> Result<OrphanOutcome, StoreError> {
        let job_id = record.job_id;
        if let Some(pid) = record.controller_pid {
            self.store.clear_controller(job_id, pid)?;
        }

        let outcome = match record.state {
            JobState::Launching => self.requeue(record, JobState::Pending, "controller lost during launch")?,
            JobState::Running => self.requeue(record, JobState::Recovering, "controller lost while running")?,
            JobState::Cancelling => OrphanOutcome::NeedsController,
            _ => OrphanOutcome::Untouched,
        };

        match outcome {
            OrphanOutcome::Requeued(state) => {
                self.admission.release(job_id);
                info!(job_id = %job_id, from = %record.state, to = %state, "Orphaned job re-queued");
            }
            OrphanOutcome::Failed => {
                self.admission.release(job_id);
                warn!(
                    job_id = %job_id,
                    from = %record.state,
                    reason = RECOVERY_CEILING_EXCEEDED,
                    "Orphaned job failed"
                );
            }
            OrphanOutcome::NeedsController => {
                info!(job_id = %job_id, "Orphaned cancellation needs a controller");
            }
            OrphanOutcome::Untouched => {}
        }
        Ok(outcome)
    }

    fn requeue(
        &self,
        record: &JobRecord,
        target: JobState,
        reason: &str,
    ) -> Result<OrphanOutcome, StoreError> {
        let result = match self.settings.next_retry(record.retry_count) {
            Some(retry) => self
                .store
                .transition(
                    record.job_id,
                    record.state,
                    StateUpdate::to(target)
                        .retry_count(retry)
                        .next_attempt_at(self.settings.retry_at(retry))
                        .reason(reason),
                )
                .map(|_| OrphanOutcome::Requeued(target)),
            None => self.fail(record, reason),
        };

        match result {
            Err(e) if e.is_stale() => {
                debug!(job_id = %record.job_id, error = %e, "Orphan moved concurrently");
                Ok(OrphanOutcome::Untouched)
            }
            other => other,
        }
    }

    /// `Running` passes through `Recovering` on its way to `Failed`.
    fn fail(&self, record: &JobRecord, reason: &str) -> Result<OrphanOutcome, StoreError> {
        let mut from = record.state;
        if from == JobState::Running {
            self.store.transition(
                record.job_id,
                from,
                StateUpdate::to(JobState::Recovering).reason(reason),
            )?;
            from = JobState::Recovering;
        }

        self.store
            .transition(record.job_id, from, StateUpdate::failed(RECOVERY_CEILING_EXCEEDED))?;
        Ok(OrphanOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::SlotBudget;
    use crate::backoff::BackoffPolicy;
    use mjobs_store::NewJob;
    use std::time::Duration;

    /// Probe with a fixed set of live pids.
    struct FixedProbe(HashSet<u32>);

    impl LivenessProbe for FixedProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    struct Fixture {
        store: Arc<JobStore>,
        admission: Arc<AdmissionController>,
        recovery: RecoveryManager,
    }

    fn fixture(alive: &[u32]) -> Fixture {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let admission =
            Arc::new(AdmissionController::new(Arc::clone(&store), SlotBudget::new(8, 8)).unwrap());
        let recovery = RecoveryManager::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            Arc::new(FixedProbe(alive.iter().copied().collect())),
            ControllerSettings {
                max_retries: 2,
                backoff: BackoffPolicy::none(),
                poll_interval: Duration::from_millis(5),
            },
        );
        Fixture {
            store,
            admission,
            recovery,
        }
    }

    fn job_in(f: &Fixture, state: JobState, pid: u32, retry_count: u32) -> JobId {
        let job_id = f.store.create(&NewJob::new("job")).unwrap();
        assert!(f.admission.try_acquire_launch(job_id).unwrap());
        if retry_count > 0 {
            f.store
                .transition(
                    job_id,
                    JobState::Launching,
                    StateUpdate::to(JobState::Pending).retry_count(retry_count),
                )
                .unwrap();
            f.admission.release(job_id);
            assert!(f.admission.try_acquire_launch(job_id).unwrap());
        }
        match state {
            JobState::Launching => {}
            JobState::Running => assert!(f.admission.promote_to_run(job_id).unwrap()),
            JobState::Cancelling => {
                f.store
                    .update_state(job_id, JobState::Launching, JobState::Cancelling)
                    .unwrap();
                f.admission.release(job_id);
            }
            other => panic!("unsupported fixture state {other}"),
        }
        f.store.set_controller(job_id, pid).unwrap();
        job_id
    }

    #[test]
    fn test_dead_launching_job_requeued() {
        let f = fixture(&[]);
        let job_id = job_in(&f, JobState::Launching, 100, 0);

        let report = f.recovery.sweep(&HashSet::new()).unwrap();
        assert_eq!(report.requeued, 1);

        let record = f.store.get(job_id).unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.controller_pid.is_none());
        assert_eq!(f.admission.usage().used_launch_slots, 0);
    }

    #[test]
    fn test_dead_running_job_recovering() {
        let f = fixture(&[]);
        let job_id = job_in(&f, JobState::Running, 100, 0);

        f.recovery.sweep(&HashSet::new()).unwrap();

        let record = f.store.get(job_id).unwrap();
        assert_eq!(record.state, JobState::Recovering);
        assert_eq!(record.retry_count, 1);
        assert_eq!(f.admission.usage().used_run_slots, 0);
    }

    #[test]
    fn test_ceiling_fails_through_recovering() {
        let f = fixture(&[]);
        let job_id = job_in(&f, JobState::Running, 100, 2);

        let report = f.recovery.sweep(&HashSet::new()).unwrap();
        assert_eq!(report.failed, 1);

        let record = f.store.get(job_id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some(RECOVERY_CEILING_EXCEEDED));
        assert_eq!(record.retry_count, 2);

        let path: Vec<JobState> = f
            .store
            .history(job_id)
            .unwrap()
            .into_iter()
            .map(|t| t.to_state)
            .collect();
        assert_eq!(
            &path[path.len() - 3..],
            &[JobState::Running, JobState::Recovering, JobState::Failed]
        );
    }

    #[test]
    fn test_live_and_tracked_controllers_untouched() {
        let f = fixture(&[200]);
        let adopted = job_in(&f, JobState::Running, 200, 0);
        let tracked = job_in(&f, JobState::Launching, std::process::id(), 0);

        let report = f.recovery.sweep(&HashSet::from([tracked])).unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.requeued, 0);

        assert_eq!(f.store.get(adopted).unwrap().state, JobState::Running);
        assert_eq!(f.store.get(tracked).unwrap().state, JobState::Launching);
    }

    #[test]
    fn test_untracked_own_pid_is_orphan() {
        let f = fixture(&[std::process::id()]);
        let job_id = job_in(&f, JobState::Launching, std::process::id(), 0);

        let report = f.recovery.sweep(&HashSet::new()).unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(f.store.get(job_id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn test_cancelling_orphan_needs_controller() {
        let f = fixture(&[]);
        let job_id = job_in(&f, JobState::Cancelling, 100, 0);

        let report = f.recovery.sweep(&HashSet::new()).unwrap();
        assert_eq!(report.respawn, vec![job_id]);
        assert_eq!(f.store.get(job_id).unwrap().state, JobState::Cancelling);
    }
}
