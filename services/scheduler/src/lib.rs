//! mjobs scheduler library
//!
//! Accepts long-running jobs from the job store, starts one controller per
//! job under two host-derived concurrency ceilings, and recovers jobs whose
//! controller died.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler loop
//! ├── AdmissionController   (launch slots, run slots)
//! ├── RecoveryManager       (orphaned controller-owned jobs)
//! └── ControllerLauncher    (child process or task per job)
//!         └── JobController (drives one job through a Backend)
//! ```
//!
//! ## Modules
//!
//! - `admission`: slot budgets and the acquire/promote/release API
//! - `backend`: cluster backend contract, mock and local backends
//! - `controller`: per-job state machine driver
//! - `recovery`: orphan detection and re-queueing
//! - `scheduler`: the coordinating loop
//! - `spawner`: controller processes/tasks and liveness probing

pub mod admission;
pub mod backend;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod recovery;
pub mod resources;
pub mod scheduler;
pub mod spawner;

// Re-export commonly used types
pub use admission::{AdmissionController, SlotBudget, SlotUsage};
pub use config::Config;
pub use controller::{ControllerExit, ControllerSettings, JobController};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use resources::HostResources;
pub use scheduler::{Scheduler, SchedulerConfig, TickStats};
