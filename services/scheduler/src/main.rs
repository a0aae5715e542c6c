//! mjobs scheduler
//!
//! `mjobs-scheduler serve` runs the scheduler loop: it admits jobs from the
//! job store under the host's launch and run slot budgets and starts one
//! controller per admitted job. `mjobs-scheduler controller --job-id N` is
//! the controller entry point the scheduler spawns in process mode.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mjobs_store::{JobId, JobStore};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mjobs_scheduler::backend::{self, PassthroughRenderer, TemplateRenderer};
use mjobs_scheduler::config::{Config, ControllerMode};
use mjobs_scheduler::spawner::{ControllerLauncher, ProcessLauncher, ProcessProbe, TaskLauncher};
use mjobs_scheduler::{
    AdmissionController, HostResources, JobController, RecoveryManager, Scheduler, SlotBudget,
};

#[derive(Parser)]
#[command(name = "mjobs-scheduler")]
#[command(about = "Managed-jobs scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop (default)
    Serve,

    /// Drive a single job; started by the scheduler
    Controller {
        /// Job to drive
        #[arg(long)]
        job_id: JobId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Controller { job_id } => run_controller(config, job_id).await,
    }
}

fn open_store(config: &Config) -> Result<Arc<JobStore>> {
    let store = JobStore::open_in_dir(&config.data_dir)
        .with_context(|| format!("failed to open job store in {}", config.data_dir.display()))?;
    Ok(Arc::new(store))
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting mjobs scheduler");

    let host = HostResources::measure().with_overrides(config.host_cpus, config.host_memory_bytes);
    let budget = SlotBudget::from_host(&host, config.launch_slots_per_cpu, config.job_memory_bytes);
    info!(
        data_dir = %config.data_dir.display(),
        cpus = host.cpus,
        memory_bytes = host.memory_bytes,
        launch_slots = budget.launch_slots,
        run_slots = budget.run_slots,
        controller_mode = ?config.controller_mode,
        backend = ?config.backend,
        "Configuration loaded"
    );

    let store = open_store(&config)?;
    let admission = Arc::new(AdmissionController::new(Arc::clone(&store), budget)?);
    let settings = config.controller_settings();

    let launcher: Arc<dyn ControllerLauncher> = match config.controller_mode {
        ControllerMode::Process => Arc::new(
            ProcessLauncher::current_exe(config.data_dir.clone(), config.controller_log_dir())
                .context("failed to locate scheduler binary")?,
        ),
        ControllerMode::InProcess => Arc::new(TaskLauncher::new(
            Arc::clone(&store),
            backend::build(config.backend, config.workload_log_dir()),
            Arc::new(PassthroughRenderer),
            settings.clone(),
        )),
    };

    let recovery = RecoveryManager::new(
        Arc::clone(&store),
        Arc::clone(&admission),
        Arc::new(ProcessProbe),
        settings,
    );
    let scheduler = Scheduler::new(
        store,
        admission,
        recovery,
        launcher,
        config.scheduler_config(),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            match (&mut scheduler_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Scheduler loop error"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(Ok(())) => info!("Scheduler loop exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Scheduler loop error");
                    return Err(e.into());
                }
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

async fn run_controller(config: Config, job_id: JobId) -> Result<()> {
    let store = open_store(&config)?;
    let renderer: Arc<dyn TemplateRenderer> = Arc::new(PassthroughRenderer);
    let controller = JobController::new(
        job_id,
        Arc::clone(&store),
        backend::build(config.backend, config.workload_log_dir()),
        renderer,
        config.controller_settings(),
    );

    let result = controller.run().await;
    store.clear_controller(job_id, std::process::id())?;

    let exit = result.with_context(|| format!("controller for job {job_id} failed"))?;
    info!(job_id = %job_id, exit = ?exit, "Controller exiting");
    Ok(())
}
