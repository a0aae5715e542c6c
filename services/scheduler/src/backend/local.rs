//! Local backend: the job's "cluster" is a shell command on this host.
//!
//! Workloads are children of the controller that launched them, each in its
//! own process group. A handle owned by another (possibly crashed) controller
//! is unknown here and polls as unreachable, which sends the job through
//! recovery. Such a handle is only signalled if its pid still carries the
//! start time recorded at launch, so a recycled pid is never touched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, ClusterHandle, LaunchSpec, WorkloadStatus};

pub struct LocalBackend {
    workloads: Mutex<HashMap<String, Child>>,
    log_dir: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            workloads: Mutex::new(HashMap::new()),
            log_dir: None,
        }
    }

    /// Append workload output to `<log_dir>/<cluster>.log`.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    fn output(&self, cluster_name: &str) -> Result<(Stdio, Stdio), std::io::Error> {
        let Some(dir) = &self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };

        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{cluster_name}.log")))?;
        Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_spawn_error(e: std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            BackendError::NonRetryable(format!("cannot start workload: {e}"))
        }
        _ => BackendError::Retryable(format!("cannot start workload: {e}")),
    }
}

/// Backend id of a workload: `local-<pid>-<start time>`.
fn backend_id(pid: u32, started: u64) -> String {
    format!("local-{pid}-{started}")
}

fn parse_backend_id(backend_id: &str) -> Option<(i32, u64)> {
    let (pid, started) = backend_id.strip_prefix("local-")?.split_once('-')?;
    Some((pid.parse().ok()?, started.parse().ok()?))
}

/// Start time of a process in clock ticks since boot (`/proc/<pid>/stat`
/// field 22).
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields resume after its ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Signal a workload's whole process group.
fn signal_group(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    match std::io::Error::last_os_error() {
        e if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        e => Err(e),
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ClusterHandle, BackendError> {
        let (stdout, stderr) = self.output(&spec.cluster_name).map_err(classify_spawn_error)?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .env("MJOBS_JOB_ID", spec.job_id.to_string())
            .env("MJOBS_CLUSTER_NAME", &spec.cluster_name)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(classify_spawn_error)?;

        let pid = child
            .id()
            .ok_or_else(|| BackendError::Retryable("workload exited before start".to_string()))?;
        // Without a start time the handle can never be signalled by pid.
        let started = process_start_time(pid).unwrap_or_else(|| {
            warn!(pid, "Cannot read workload start time");
            0
        });
        let handle = ClusterHandle {
            cluster_name: spec.cluster_name.clone(),
            backend_id: backend_id(pid, started),
            launched_at: Utc::now(),
        };

        info!(
            job_id = %spec.job_id,
            cluster = %spec.cluster_name,
            pid,
            "Local workload started"
        );
        self.workloads
            .lock()
            .await
            .insert(handle.backend_id.clone(), child);
        Ok(handle)
    }

    async fn poll_status(&self, handle: &ClusterHandle) -> WorkloadStatus {
        let mut workloads = self.workloads.lock().await;
        let Some(child) = workloads.get_mut(&handle.backend_id) else {
            return WorkloadStatus::Unreachable;
        };

        match child.try_wait() {
            Ok(None) => WorkloadStatus::Running,
            Ok(Some(status)) if status.success() => WorkloadStatus::Succeeded,
            Ok(Some(status)) => WorkloadStatus::Failed(format!("workload exited with {status}")),
            Err(e) => {
                warn!(cluster = %handle.cluster_name, error = %e, "Failed to poll workload");
                WorkloadStatus::Unreachable
            }
        }
    }

    async fn terminate(&self, handle: &ClusterHandle) -> Result<(), BackendError> {
        let child = self.workloads.lock().await.remove(&handle.backend_id);

        match child {
            Some(mut child) => {
                if child.try_wait().ok().flatten().is_some() {
                    return Ok(());
                }
                if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
                    if let Err(e) = signal_group(pid, libc::SIGKILL) {
                        warn!(
                            cluster = %handle.cluster_name,
                            pid,
                            error = %e,
                            "Failed to kill workload group"
                        );
                    }
                }
                child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Retryable(format!("kill failed: {e}")))?;
                debug!(cluster = %handle.cluster_name, "Local workload killed");
                Ok(())
            }
            None => {
                // Left behind by another controller.
                let Some((pid, started)) = parse_backend_id(&handle.backend_id) else {
                    debug!(
                        cluster = %handle.cluster_name,
                        backend_id = %handle.backend_id,
                        "Unrecognized handle, nothing to tear down"
                    );
                    return Ok(());
                };
                let current = u32::try_from(pid).ok().and_then(process_start_time);
                if current != Some(started) {
                    debug!(cluster = %handle.cluster_name, pid, "Workload already gone");
                    return Ok(());
                }

                signal_group(pid, libc::SIGTERM)
                    .map_err(|e| BackendError::Retryable(format!("kill {pid} failed: {e}")))?;
                debug!(cluster = %handle.cluster_name, pid, "Orphaned workload signalled");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mjobs_store::JobId;
    use rstest::rstest;
    use std::time::Duration;

    fn spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            job_id: JobId::new(1),
            cluster_name: "mjobs-1".to_string(),
            descriptor: command.to_string(),
            command: command.to_string(),
        }
    }

    async fn wait_for_exit(backend: &LocalBackend, handle: &ClusterHandle) -> WorkloadStatus {
        for _ in 0..200 {
            let status = backend.poll_status(handle).await;
            if status != WorkloadStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workload did not exit");
    }

    #[tokio::test]
    async fn test_successful_workload() {
        let backend = LocalBackend::new();
        let handle = backend.launch(&spec("exit 0")).await.unwrap();
        assert!(handle.backend_id.starts_with("local-"));

        assert_eq!(wait_for_exit(&backend, &handle).await, WorkloadStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failing_workload() {
        let backend = LocalBackend::new();
        let handle = backend.launch(&spec("exit 3")).await.unwrap();

        match wait_for_exit(&backend, &handle).await {
            WorkloadStatus::Failed(reason) => assert!(reason.contains('3')),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_running_workload() {
        let backend = LocalBackend::new();
        let handle = backend.launch(&spec("sleep 30")).await.unwrap();
        assert_eq!(backend.poll_status(&handle).await, WorkloadStatus::Running);

        backend.terminate(&handle).await.unwrap();
        assert_eq!(backend.poll_status(&handle).await, WorkloadStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_unknown_handle_is_unreachable() {
        let backend = LocalBackend::new();
        let handle = ClusterHandle {
            cluster_name: "mjobs-9".to_string(),
            backend_id: "elsewhere".to_string(),
            launched_at: Utc::now(),
        };

        assert_eq!(backend.poll_status(&handle).await, WorkloadStatus::Unreachable);
        assert!(backend.terminate(&handle).await.is_ok());
    }

    #[rstest]
    #[case("local-42-1234", Some((42, 1234)))]
    #[case("local-42", None)]
    #[case("local-x-1", None)]
    #[case("mock-3", None)]
    fn parses_backend_ids(#[case] id: &str, #[case] expected: Option<(i32, u64)>) {
        assert_eq!(parse_backend_id(id), expected);
    }

    #[test]
    fn reads_own_start_time() {
        let started = process_start_time(std::process::id());
        assert!(started.is_some());
        assert_eq!(process_start_time(std::process::id()), started);
    }

    fn bystander() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[tokio::test]
    async fn test_stale_handle_never_signals_unrelated_process() {
        let mut other = bystander();
        let pid = other.id();
        let backend = LocalBackend::new();

        for backend_id in [
            format!("local-{pid}"),
            backend_id(pid, process_start_time(pid).unwrap() + 1),
        ] {
            let handle = ClusterHandle {
                cluster_name: "mjobs-7".to_string(),
                backend_id,
                launched_at: Utc::now(),
            };
            backend.terminate(&handle).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(other.try_wait().unwrap().is_none());
        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test]
    async fn test_workload_of_crashed_controller_is_torn_down() {
        let launcher = LocalBackend::new();
        let handle = launcher.launch(&spec("sleep 30")).await.unwrap();

        // A fresh controller knows only the persisted handle.
        LocalBackend::new().terminate(&handle).await.unwrap();

        match wait_for_exit(&launcher, &handle).await {
            WorkloadStatus::Failed(_) => {}
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_goes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new().with_log_dir(dir.path().to_path_buf());
        let handle = backend.launch(&spec("echo hello")).await.unwrap();
        wait_for_exit(&backend, &handle).await;

        let log = std::fs::read_to_string(dir.path().join("mjobs-1.log")).unwrap();
        assert_eq!(log.trim(), "hello");
    }
}
