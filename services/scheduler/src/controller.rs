//! Per-job controller.
//!
//! A controller drives one job through its lifecycle while the job is in a
//! controller-owned state (`Launching`, `Running`, `Cancelling`). It re-reads
//! the record at every decision point, commits each step with a
//! compare-and-swap against the state it last read, and reconciles instead
//! of failing when it loses a race. It exits once the job is terminal or has
//! been handed back to the admission queue (`Pending`, `Recovering`); the
//! scheduler spawns a fresh controller when the job is admitted again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mjobs_store::{JobId, JobRecord, JobState, JobStore, StateUpdate, StoreError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, ClusterHandle, TemplateRenderer, WorkloadStatus};
use crate::backoff::BackoffPolicy;

/// Failure reason for jobs that exhausted their retries while recovering.
pub const RECOVERY_CEILING_EXCEEDED: &str = "recovery retry ceiling exceeded";

/// Retry and polling settings shared by controllers and recovery.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Retry ceiling for launches and recoveries.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Interval between workload status polls.
    pub poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ControllerSettings {
    /// Retry count after one more attempt, or `None` at the ceiling.
    pub fn next_retry(&self, retry_count: u32) -> Option<u32> {
        (retry_count < self.max_retries).then_some(retry_count + 1)
    }

    /// When the given retry becomes admissible.
    pub fn retry_at(&self, retry: u32) -> DateTime<Utc> {
        self.backoff.next_attempt_at(retry)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot encode cluster handle: {0}")]
    Handle(#[from] serde_json::Error),
}

/// Why a controller returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerExit {
    /// The job reached a terminal state.
    Finished(JobState),
    /// The job went back to the admission queue.
    Requeued(JobState),
}

pub struct JobController {
    job_id: JobId,
    store: Arc<JobStore>,
    backend: Arc<dyn Backend>,
    renderer: Arc<dyn TemplateRenderer>,
    settings: ControllerSettings,
}

impl JobController {
    pub fn new(
        job_id: JobId,
        store: Arc<JobStore>,
        backend: Arc<dyn Backend>,
        renderer: Arc<dyn TemplateRenderer>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            job_id,
            store,
            backend,
            renderer,
            settings,
        }
    }

    /// Drive the job until it is terminal or re-queued.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn run(&self) -> Result<ControllerExit, ControllerError> {
        info!("Controller started");

        loop {
            let record = self.store.get(self.job_id)?;

            if record.cancel_requested
                && !record.state.is_terminal()
                && record.state != JobState::Cancelling
            {
                self.commit(&record, StateUpdate::to(JobState::Cancelling).reason("cancel requested"))?;
                continue;
            }

            match record.state {
                JobState::Succeeded | JobState::Failed | JobState::Cancelled => {
                    info!(state = %record.state, "Controller finished");
                    return Ok(ControllerExit::Finished(record.state));
                }
                JobState::Pending | JobState::Recovering => {
                    info!(state = %record.state, retry_count = record.retry_count, "Job re-queued");
                    return Ok(ControllerExit::Requeued(record.state));
                }
                JobState::Launching => self.drive_launching(&record).await?,
                JobState::Running => self.drive_running(&record).await?,
                JobState::Cancelling => self.drive_cancelling(&record).await?,
            }
        }
    }

    /// Compare-and-swap from the state in `record`; `Ok(false)` if another
    /// actor moved the job first.
    fn commit(&self, record: &JobRecord, update: StateUpdate) -> Result<bool, ControllerError> {
        let target = update.target();
        match self.store.transition(self.job_id, record.state, update) {
            Ok(_) => {
                info!(from = %record.state, to = %target, "Job transitioned");
                Ok(true)
            }
            Err(e) if e.is_stale() => {
                debug!(error = %e, "Lost transition race, reconciling");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drive_launching(&self, record: &JobRecord) -> Result<(), ControllerError> {
        if record.launch_ready {
            // Launched; the scheduler moves the job to Running once a run slot frees up.
            tokio::time::sleep(self.settings.poll_interval).await;
            return Ok(());
        }

        if let Some(stale) = &record.cluster_handle {
            info!("Tearing down cluster left by a previous attempt");
            self.teardown(stale).await;
            self.store.clear_cluster(self.job_id)?;
        }

        let spec = match self.renderer.render(self.job_id, &record.resources_descriptor) {
            Ok(spec) => spec,
            Err(e) => {
                self.commit(record, StateUpdate::failed(e.to_string()))?;
                return Ok(());
            }
        };

        info!(cluster = %spec.cluster_name, attempt = record.retry_count + 1, "Launching cluster");
        match self.backend.launch(&spec).await {
            Ok(handle) => {
                let encoded = handle.encode()?;
                match self.store.record_launch(self.job_id, &encoded) {
                    Ok(_) => info!(cluster = %handle.cluster_name, "Cluster launched, awaiting run slot"),
                    Err(e) if e.is_stale() => {
                        warn!(error = %e, "Job moved during launch, tearing down new cluster");
                        self.terminate_quietly(&handle).await;
                    }
                    Err(e) => {
                        self.terminate_quietly(&handle).await;
                        return Err(e.into());
                    }
                }
            }
            Err(e) if e.is_retryable() => match self.settings.next_retry(record.retry_count) {
                Some(retry) => {
                    warn!(error = %e, retry, "Retryable launch failure, re-queueing");
                    self.commit(
                        record,
                        StateUpdate::to(JobState::Pending)
                            .retry_count(retry)
                            .next_attempt_at(self.settings.retry_at(retry))
                            .reason(e.to_string()),
                    )?;
                }
                None => {
                    warn!(error = %e, "Retry ceiling reached");
                    self.commit(
                        record,
                        StateUpdate::failed(format!(
                            "launch failed after {} retries: {e}",
                            record.retry_count
                        )),
                    )?;
                }
            },
            Err(e) => {
                warn!(error = %e, "Non-retryable launch failure");
                self.commit(record, StateUpdate::failed(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn drive_running(&self, record: &JobRecord) -> Result<(), ControllerError> {
        let handle = record
            .cluster_handle
            .as_deref()
            .and_then(|raw| ClusterHandle::decode(raw).ok());

        let status = match &handle {
            Some(handle) => self.backend.poll_status(handle).await,
            None => WorkloadStatus::Unreachable,
        };

        // Cancellation observed while polling wins over the poll result.
        let current = self.store.get(self.job_id)?;
        if current.state != JobState::Running || current.cancel_requested {
            return Ok(());
        }

        match status {
            WorkloadStatus::Running => {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
            WorkloadStatus::Succeeded => {
                if self.commit(&current, StateUpdate::to(JobState::Succeeded).reason("workload succeeded"))? {
                    self.teardown_handle(handle.as_ref()).await;
                }
            }
            WorkloadStatus::Failed(reason) => {
                if self.commit(&current, StateUpdate::failed(format!("workload failed: {reason}")))? {
                    self.teardown_handle(handle.as_ref()).await;
                }
            }
            WorkloadStatus::Unreachable => {
                warn!(retry_count = current.retry_count, "Cluster unreachable");
                self.teardown_handle(handle.as_ref()).await;

                match self.settings.next_retry(current.retry_count) {
                    Some(retry) => {
                        self.commit(
                            &current,
                            StateUpdate::to(JobState::Recovering)
                                .retry_count(retry)
                                .next_attempt_at(self.settings.retry_at(retry))
                                .clear_cluster()
                                .reason("cluster unreachable"),
                        )?;
                    }
                    None => {
                        if self.commit(
                            &current,
                            StateUpdate::to(JobState::Recovering)
                                .clear_cluster()
                                .reason("cluster unreachable"),
                        )? {
                            let recovering = self.store.get(self.job_id)?;
                            self.commit(&recovering, StateUpdate::failed(RECOVERY_CEILING_EXCEEDED))?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn drive_cancelling(&self, record: &JobRecord) -> Result<(), ControllerError> {
        if let Some(raw) = &record.cluster_handle {
            self.teardown(raw).await;
        }

        self.commit(
            record,
            StateUpdate::to(JobState::Cancelled)
                .clear_cluster()
                .reason("cancelled by user"),
        )?;
        Ok(())
    }

    /// Best-effort teardown of a persisted handle.
    async fn teardown(&self, raw: &str) {
        match ClusterHandle::decode(raw) {
            Ok(handle) => self.terminate_quietly(&handle).await,
            Err(e) => warn!(error = %e, "Unreadable cluster handle, skipping teardown"),
        }
    }

    async fn teardown_handle(&self, handle: Option<&ClusterHandle>) {
        if let Some(handle) = handle {
            self.terminate_quietly(handle).await;
        }
    }

    async fn terminate_quietly(&self, handle: &ClusterHandle) {
        if let Err(e) = self.backend.terminate(handle).await {
            warn!(cluster = %handle.cluster_name, error = %e, "Cluster teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, LaunchSpec, MockBackend, PassthroughRenderer, RenderError};
    use mjobs_store::NewJob;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            max_retries: 2,
            backoff: BackoffPolicy::none(),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn launching_job(store: &JobStore, descriptor: &str) -> JobId {
        let job_id = store.create(&NewJob::new(descriptor)).unwrap();
        store
            .update_state(job_id, JobState::Pending, JobState::Launching)
            .unwrap();
        job_id
    }

    fn controller(store: &Arc<JobStore>, backend: &Arc<MockBackend>, job_id: JobId) -> JobController {
        JobController::new(
            job_id,
            Arc::clone(store),
            Arc::clone(backend) as Arc<dyn Backend>,
            Arc::new(PassthroughRenderer),
            settings(),
        )
    }

    #[test]
    fn test_next_retry_ceiling() {
        let settings = settings();
        assert_eq!(settings.next_retry(0), Some(1));
        assert_eq!(settings.next_retry(1), Some(2));
        assert_eq!(settings.next_retry(2), None);
    }

    #[tokio::test]
    async fn test_retryable_launch_failure_requeues() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        backend.script_launches("flaky", vec![Err(BackendError::Retryable("no capacity".into()))]);
        let job_id = launching_job(&store, "flaky");

        let exit = controller(&store, &backend, job_id).run().await.unwrap();
        assert_eq!(exit, ControllerExit::Requeued(JobState::Pending));

        let record = store.get(job_id).unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(record.next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_non_retryable_launch_failure_fails() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        backend.script_launches("bad", vec![Err(BackendError::NonRetryable("no such image".into()))]);
        let job_id = launching_job(&store, "bad");

        let exit = controller(&store, &backend, job_id).run().await.unwrap();
        assert_eq!(exit, ControllerExit::Finished(JobState::Failed));

        let record = store.get(job_id).unwrap();
        assert!(record.failure_reason.unwrap().contains("no such image"));
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_at_ceiling_fails() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        backend.script_launches("flaky", vec![Err(BackendError::Retryable("no capacity".into()))]);
        let job_id = launching_job(&store, "flaky");
        store
            .transition(
                job_id,
                JobState::Launching,
                StateUpdate::to(JobState::Pending).retry_count(2),
            )
            .unwrap();
        store
            .update_state(job_id, JobState::Pending, JobState::Launching)
            .unwrap();

        let exit = controller(&store, &backend, job_id).run().await.unwrap();
        assert_eq!(exit, ControllerExit::Finished(JobState::Failed));
        assert_eq!(store.get(job_id).unwrap().retry_count, 2);
    }

    struct RejectingRenderer;

    impl TemplateRenderer for RejectingRenderer {
        fn render(&self, _job_id: JobId, descriptor: &str) -> Result<LaunchSpec, RenderError> {
            Err(RenderError(format!("unknown accelerator in {descriptor:?}")))
        }
    }

    #[tokio::test]
    async fn test_render_error_fails_job() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        let job_id = launching_job(&store, "tpu:v9");

        let controller = JobController::new(
            job_id,
            Arc::clone(&store),
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::new(RejectingRenderer),
            settings(),
        );
        let exit = controller.run().await.unwrap();
        assert_eq!(exit, ControllerExit::Finished(JobState::Failed));
        assert!(store
            .get(job_id)
            .unwrap()
            .failure_reason
            .unwrap()
            .contains("unknown accelerator"));
        assert_eq!(backend.launch_attempts("tpu:v9"), 0);
    }

    #[tokio::test]
    async fn test_terminal_job_left_alone() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        let job_id = launching_job(&store, "job");
        store
            .transition(job_id, JobState::Launching, StateUpdate::failed("quota"))
            .unwrap();

        let exit = controller(&store, &backend, job_id).run().await.unwrap();
        assert_eq!(exit, ControllerExit::Finished(JobState::Failed));
        assert_eq!(backend.launch_attempts("job"), 0);
    }

    #[tokio::test]
    async fn test_stale_cluster_torn_down_before_relaunch() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        let job_id = launching_job(&store, "job");

        let stale = ClusterHandle {
            cluster_name: "mjobs-old".to_string(),
            backend_id: "mock-stale".to_string(),
            launched_at: Utc::now(),
        };
        store.record_launch(job_id, &stale.encode().unwrap()).unwrap();
        store
            .transition(
                job_id,
                JobState::Launching,
                StateUpdate::to(JobState::Pending).retry_count(1),
            )
            .unwrap();
        store
            .update_state(job_id, JobState::Pending, JobState::Launching)
            .unwrap();

        let controller = controller(&store, &backend, job_id);
        let run = tokio::spawn(async move { controller.run().await });

        for _ in 0..100 {
            if store.get(job_id).unwrap().launch_ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.get(job_id).unwrap().launch_ready);
        assert_eq!(backend.terminated(), vec![stale]);

        store.request_cancel(job_id).unwrap();
        assert_eq!(
            run.await.unwrap().unwrap(),
            ControllerExit::Finished(JobState::Cancelled)
        );
        assert_eq!(backend.live_clusters(), 0);
    }

    #[tokio::test]
    async fn test_cancel_with_failing_teardown_still_cancels() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        backend.fail_terminations(BackendError::Retryable("api down".into()));
        let job_id = launching_job(&store, "job");
        store.request_cancel(job_id).unwrap();

        let exit = controller(&store, &backend, job_id).run().await.unwrap();
        assert_eq!(exit, ControllerExit::Finished(JobState::Cancelled));
        assert!(store.get(job_id).unwrap().cluster_handle.is_none());
    }
}
