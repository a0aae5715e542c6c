//! Starting controllers and probing their liveness.
//!
//! Controllers run as child processes of the scheduler binary
//! (`mjobs-scheduler controller --job-id N`) or, in in-process mode, as
//! tokio tasks. Either way the scheduler keeps a [`ControllerHandle`] and
//! reaps it without blocking.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use mjobs_store::{JobId, JobStore};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::backend::{Backend, TemplateRenderer};
use crate::controller::{ControllerExit, ControllerSettings, JobController};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn controller for job {job_id}: {source}")]
    Io {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("controller for job {0} exited before reporting a pid")]
    NoPid(JobId),
}

/// How a reaped controller ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapedExit {
    /// Returned normally (terminal or re-queued job).
    Clean,
    /// Crashed, panicked or returned an error.
    Abnormal(String),
}

enum HandleInner {
    Process(Child),
    Task(oneshot::Receiver<Result<ControllerExit, String>>),
}

/// A controller started by this scheduler.
pub struct ControllerHandle {
    pid: u32,
    inner: HandleInner,
}

impl ControllerHandle {
    /// Pid recorded in the job row.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking: `Some` once the controller has exited.
    pub fn try_reap(&mut self) -> Option<ReapedExit> {
        match &mut self.inner {
            HandleInner::Process(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) if status.success() => Some(ReapedExit::Clean),
                Ok(Some(status)) => Some(ReapedExit::Abnormal(format!("exited with {status}"))),
                Err(e) => Some(ReapedExit::Abnormal(format!("wait failed: {e}"))),
            },
            HandleInner::Task(rx) => match rx.try_recv() {
                Ok(Ok(_)) => Some(ReapedExit::Clean),
                Ok(Err(e)) => Some(ReapedExit::Abnormal(e)),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Some(ReapedExit::Abnormal("controller task panicked".to_string()))
                }
            },
        }
    }
}

/// Starts a controller for a job.
pub trait ControllerLauncher: Send + Sync {
    fn spawn(&self, job_id: JobId) -> Result<ControllerHandle, SpawnError>;
}

/// Runs each controller as a child process of the scheduler binary.
pub struct ProcessLauncher {
    program: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, data_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            program,
            data_dir,
            log_dir,
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(data_dir: PathBuf, log_dir: PathBuf) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, data_dir, log_dir))
    }
}

impl ControllerLauncher for ProcessLauncher {
    fn spawn(&self, job_id: JobId) -> Result<ControllerHandle, SpawnError> {
        let io_err = |source| SpawnError::Io { job_id, source };

        std::fs::create_dir_all(&self.log_dir).map_err(io_err)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(format!("{job_id}.log")))
            .map_err(io_err)?;
        let stderr = log.try_clone().map_err(io_err)?;

        let child = Command::new(&self.program)
            .arg("controller")
            .arg("--job-id")
            .arg(job_id.to_string())
            .env("MJOBS_DATA_DIR", &self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(io_err)?;

        let pid = child.id().ok_or(SpawnError::NoPid(job_id))?;
        debug!(job_id = %job_id, pid, "Controller process spawned");

        Ok(ControllerHandle {
            pid,
            inner: HandleInner::Process(child),
        })
    }
}

/// Runs each controller as a task of the current tokio runtime.
pub struct TaskLauncher {
    store: Arc<JobStore>,
    backend: Arc<dyn Backend>,
    renderer: Arc<dyn TemplateRenderer>,
    settings: ControllerSettings,
}

impl TaskLauncher {
    pub fn new(
        store: Arc<JobStore>,
        backend: Arc<dyn Backend>,
        renderer: Arc<dyn TemplateRenderer>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            backend,
            renderer,
            settings,
        }
    }
}

impl ControllerLauncher for TaskLauncher {
    fn spawn(&self, job_id: JobId) -> Result<ControllerHandle, SpawnError> {
        let controller = JobController::new(
            job_id,
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            Arc::clone(&self.renderer),
            self.settings.clone(),
        );
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = controller.run().await.map_err(|e| {
                error!(job_id = %job_id, error = %e, "Controller failed");
                e.to_string()
            });
            let _ = tx.send(result);
        });

        Ok(ControllerHandle {
            pid: std::process::id(),
            inner: HandleInner::Task(rx),
        })
    }
}

/// Checks whether a controller pid is still alive.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Signal-0 probe against the OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }

        let rc = unsafe { libc::kill(pid, 0) };
        // EPERM: the process exists but belongs to someone else.
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}
