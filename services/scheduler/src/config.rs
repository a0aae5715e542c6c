//! Configuration for the scheduler and its controllers.
//!
//! Read once from `MJOBS_*` environment variables at startup. Controller
//! child processes inherit the environment and load the same values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::backoff::BackoffPolicy;
use crate::controller::ControllerSettings;
use crate::scheduler::SchedulerConfig;

/// How job controllers are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    /// One child OS process per job.
    Process,
    /// One tokio task per job inside the scheduler process.
    InProcess,
}

impl FromStr for ControllerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Self::Process),
            "in-process" | "task" => Ok(Self::InProcess),
            other => bail!("unknown controller mode: {other} (expected process or in-process)"),
        }
    }
}

/// Which cluster backend controllers talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The "cluster" is a local shell command.
    Local,
    /// Simulated clusters that complete after a few polls.
    Mock,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown backend: {other} (expected local or mock)"),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Holds `jobs.db` and controller logs.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Overrides the measured vCPU count.
    pub host_cpus: Option<u32>,

    /// Overrides the measured memory size.
    pub host_memory_bytes: Option<u64>,

    /// Memory reserved per running controller.
    pub job_memory_bytes: u64,

    /// Launch slots per vCPU.
    pub launch_slots_per_cpu: f64,

    /// Retry ceiling for launches and recoveries.
    pub max_retries: u32,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,

    /// Controller poll interval for workload status.
    pub status_poll_interval: Duration,

    /// Scheduler tick.
    pub schedule_interval: Duration,

    /// Interval between recovery sweeps.
    pub recovery_interval: Duration,

    pub controller_mode: ControllerMode,
    pub backend: BackendKind,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("MJOBS_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => mjobs_store::default_data_dir()?,
        };

        let config = Self {
            data_dir,
            log_level: lookup("MJOBS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            host_cpus: parse_opt(&lookup, "MJOBS_HOST_CPUS")?,
            host_memory_bytes: parse_opt(&lookup, "MJOBS_HOST_MEMORY_BYTES")?,
            job_memory_bytes: parse_or(&lookup, "MJOBS_JOB_MEMORY_BYTES", 350_000_000)?,
            launch_slots_per_cpu: parse_or(&lookup, "MJOBS_LAUNCH_SLOTS_PER_CPU", 4.0)?,
            max_retries: parse_or(&lookup, "MJOBS_MAX_RETRIES", 3)?,
            backoff_base: Duration::from_millis(parse_or(&lookup, "MJOBS_BACKOFF_BASE_MS", 1_000)?),
            backoff_max: Duration::from_millis(parse_or(&lookup, "MJOBS_BACKOFF_MAX_MS", 60_000)?),
            backoff_jitter: parse_or(&lookup, "MJOBS_BACKOFF_JITTER", 0.25)?,
            status_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "MJOBS_STATUS_POLL_MS",
                5_000,
            )?),
            schedule_interval: Duration::from_millis(parse_or(
                &lookup,
                "MJOBS_SCHEDULE_INTERVAL_MS",
                1_000,
            )?),
            recovery_interval: Duration::from_secs(parse_or(
                &lookup,
                "MJOBS_RECOVERY_INTERVAL_SECS",
                30,
            )?),
            controller_mode: parse_or(&lookup, "MJOBS_CONTROLLER_MODE", ControllerMode::Process)?,
            backend: parse_or(&lookup, "MJOBS_BACKEND", BackendKind::Local)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values no budget or timer can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.job_memory_bytes == 0 {
            bail!("MJOBS_JOB_MEMORY_BYTES must be positive");
        }
        if !(self.launch_slots_per_cpu > 0.0) {
            bail!("MJOBS_LAUNCH_SLOTS_PER_CPU must be positive");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            bail!("MJOBS_BACKOFF_JITTER must be within 0.0..=1.0");
        }
        if self.backoff_max < self.backoff_base {
            bail!("MJOBS_BACKOFF_MAX_MS must not be below MJOBS_BACKOFF_BASE_MS");
        }
        if self.schedule_interval.is_zero() || self.recovery_interval.is_zero() {
            bail!("scheduler intervals must be positive");
        }
        if self.status_poll_interval.is_zero() {
            bail!("MJOBS_STATUS_POLL_MS must be positive");
        }
        if self.host_cpus == Some(0) || self.host_memory_bytes == Some(0) {
            bail!("host resource overrides must be positive");
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
            jitter: self.backoff_jitter,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            max_retries: self.max_retries,
            backoff: self.backoff_policy(),
            poll_interval: self.status_poll_interval,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            schedule_interval: self.schedule_interval,
            recovery_interval: self.recovery_interval,
        }
    }

    /// Per-job controller log files.
    pub fn controller_log_dir(&self) -> PathBuf {
        self.data_dir.join("controller-logs")
    }

    /// Output of workloads run by the local backend.
    pub fn workload_log_dir(&self) -> PathBuf {
        self.data_dir.join("workload-logs")
    }
}

fn parse_opt<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(None),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
