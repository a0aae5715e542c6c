//! Scheduler loop.
//!
//! The single coordinating process. Each tick it:
//! - reaps exited controllers and hands jobs they left behind to recovery
//! - settles cancellation of jobs that have no controller
//! - promotes launched jobs into run slots, oldest first
//! - admits waiting jobs into launch slots, oldest first, spawning a
//!   controller for each
//!
//! Recovery sweeps run on their own interval, and once before anything is
//! admitted. The loop never talks to a backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mjobs_store::{JobId, JobState, JobStore, StateUpdate, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::admission::AdmissionController;
use crate::recovery::{OrphanOutcome, RecoveryManager, RecoveryReport};
use crate::spawner::{ControllerHandle, ControllerLauncher, ReapedExit};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Scheduler loop timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule_interval: Duration,
    pub recovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(1),
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub reaped: usize,
    pub recovered: usize,
    pub cancelled: usize,
    pub promoted: usize,
    pub admitted: usize,
}

impl TickStats {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    store: Arc<JobStore>,
    admission: Arc<AdmissionController>,
    recovery: RecoveryManager,
    launcher: Arc<dyn ControllerLauncher>,
    config: SchedulerConfig,
    controllers: HashMap<JobId, ControllerHandle>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        admission: Arc<AdmissionController>,
        recovery: RecoveryManager,
        launcher: Arc<dyn ControllerLauncher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            admission,
            recovery,
            launcher,
            config,
            controllers: HashMap::new(),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Jobs whose controller this scheduler started and has not reaped.
    pub fn tracked(&self) -> HashSet<JobId> {
        self.controllers.keys().copied().collect()
    }

    /// Run a recovery sweep and respawn controllers it asks for.
    pub fn recover(&mut self) -> Result<RecoveryReport, SchedulerError> {
        let report = self.recovery.sweep(&self.tracked())?;
        for job_id in &report.respawn {
            self.spawn_controller(*job_id)?;
        }

        if !report.is_empty() {
            info!(
                scanned = report.scanned,
                adopted = report.adopted,
                requeued = report.requeued,
                failed = report.failed,
                respawned = report.respawn.len(),
                "Recovery sweep complete"
            );
        }
        Ok(report)
    }

    /// One scheduling pass.
    pub fn tick(&mut self) -> Result<TickStats, SchedulerError> {
        let mut stats = TickStats::default();

        self.reap(&mut stats)?;
        // Also frees slots of adopted controllers, which are never reaped here.
        self.admission.refresh()?;
        self.settle_cancellations(&mut stats)?;
        self.promote(&mut stats)?;
        self.admit(&mut stats)?;

        Ok(stats)
    }

    /// Recover, then tick until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let usage = self.admission.usage();
        info!(
            schedule_interval_ms = self.config.schedule_interval.as_millis() as u64,
            recovery_interval_secs = self.config.recovery_interval.as_secs(),
            launch_slots = usage.total_launch_slots,
            run_slots = usage.total_run_slots,
            "Starting scheduler loop"
        );

        // Startup sweep before the first admission.
        self.recover()?;

        let mut schedule = tokio::time::interval(self.config.schedule_interval);
        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        recovery.tick().await;

        loop {
            tokio::select! {
                _ = schedule.tick() => {
                    match self.tick() {
                        Ok(stats) if !stats.is_idle() => {
                            let usage = self.admission.usage();
                            info!(
                                reaped = stats.reaped,
                                recovered = stats.recovered,
                                cancelled = stats.cancelled,
                                promoted = stats.promoted,
                                admitted = stats.admitted,
                                used_launch_slots = usage.used_launch_slots,
                                used_run_slots = usage.used_run_slots,
                                "Scheduler tick complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover() {
                        error!(error = %e, "Recovery sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            controllers = self.controllers.len(),
                            "Scheduler loop shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn reap(&mut self, stats: &mut TickStats) -> Result<(), SchedulerError> {
        let exited: Vec<(JobId, u32, ReapedExit)> = self
            .controllers
            .iter_mut()
            .filter_map(|(job_id, handle)| handle.try_reap().map(|exit| (*job_id, handle.pid(), exit)))
            .collect();

        for (job_id, pid, exit) in exited {
            self.controllers.remove(&job_id);
            stats.reaped += 1;
            match &exit {
                ReapedExit::Clean => debug!(job_id = %job_id, pid, "Controller exited"),
                ReapedExit::Abnormal(reason) => {
                    warn!(job_id = %job_id, pid, reason = %reason, "Controller exited abnormally")
                }
            }

            self.store.clear_controller(job_id, pid)?;
            let record = self.store.get(job_id)?;
            if record.state.is_controller_owned() {
                match self.recovery.recover_orphan(&record)? {
                    OrphanOutcome::NeedsController => {
                        self.spawn_controller(job_id)?;
                    }
                    OrphanOutcome::Requeued(_) | OrphanOutcome::Failed => stats.recovered += 1,
                    OrphanOutcome::Untouched => {}
                }
            }
        }

        Ok(())
    }

    /// Jobs waiting in the queue have no controller to observe their
    /// cancellation flag.
    fn settle_cancellations(&mut self, stats: &mut TickStats) -> Result<(), SchedulerError> {
        for record in self.store.list_cancel_requested()? {
            if !record.state.is_admissible() || self.controllers.contains_key(&record.job_id) {
                continue;
            }

            match self
                .store
                .update_state(record.job_id, record.state, JobState::Cancelling)
            {
                Ok(_) => {}
                Err(e) if e.is_stale() => continue,
                Err(e) => return Err(e.into()),
            }
            stats.cancelled += 1;

            if record.cluster_handle.is_some() {
                // A cluster from an earlier attempt may still be up.
                self.spawn_controller(record.job_id)?;
                continue;
            }

            match self.store.transition(
                record.job_id,
                JobState::Cancelling,
                StateUpdate::to(JobState::Cancelled).reason("cancelled before launch"),
            ) {
                Ok(_) => info!(job_id = %record.job_id, "Job cancelled"),
                Err(e) if e.is_stale() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn promote(&mut self, stats: &mut TickStats) -> Result<(), SchedulerError> {
        for record in self.store.list_awaiting_promotion()? {
            if self.admission.free_run_slots() == 0 {
                break;
            }
            if self.admission.promote_to_run(record.job_id)? {
                info!(job_id = %record.job_id, "Job running");
                stats.promoted += 1;
            }
        }
        Ok(())
    }

    fn admit(&mut self, stats: &mut TickStats) -> Result<(), SchedulerError> {
        for record in self.store.list_admissible(Utc::now())? {
            if self.admission.free_launch_slots() == 0 {
                break;
            }
            if self.controllers.contains_key(&record.job_id) {
                continue;
            }
            if self.admission.try_acquire_launch(record.job_id)? {
                stats.admitted += 1;
                info!(
                    job_id = %record.job_id,
                    from = %record.state,
                    retry_count = record.retry_count,
                    "Job admitted"
                );
                self.spawn_controller(record.job_id)?;
            }
        }
        Ok(())
    }

    fn spawn_controller(&mut self, job_id: JobId) -> Result<bool, SchedulerError> {
        match self.launcher.spawn(job_id) {
            Ok(handle) => {
                let pid = handle.pid();
                // Track first: a tracked job is never treated as an orphan.
                self.controllers.insert(job_id, handle);
                match self.store.set_controller(job_id, pid) {
                    Ok(()) => debug!(job_id = %job_id, pid, "Controller started"),
                    Err(e) => warn!(
                        job_id = %job_id,
                        pid,
                        error = %e,
                        "Controller started but its pid was not recorded"
                    ),
                }
                Ok(true)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to spawn controller");
                let record = self.store.get(job_id)?;
                self.recovery.recover_orphan(&record)?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.schedule_interval, Duration::from_secs(1));
        assert_eq!(config.recovery_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_tick_stats_idle() {
        assert!(TickStats::default().is_idle());
        assert!(!TickStats {
            admitted: 1,
            ..TickStats::default()
        }
        .is_idle());
    }
}
