//! Admission control over the two host slot budgets.
//!
//! Launch slots bound how many controllers provision clusters at once
//! (CPU-heavy); run slots bound how many controllers stay resident while
//! their workload runs (memory-heavy). A job holds at most one slot: a
//! launch slot while `Launching`, a run slot while `Running`.
//!
//! Every slot change is paired with the store compare-and-swap that moves
//! the job into the matching state, inside the same critical section, so
//! the in-memory counters and the stored states cannot drift apart through
//! this API. Counters are rebuilt from the store on construction and
//! pruned by [`AdmissionController::refresh`] when controllers move jobs
//! out of slot-holding states on their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mjobs_store::{JobId, JobState, JobStore, StateUpdate, StoreError};
use serde::Serialize;
use tracing::{debug, info};

use crate::resources::HostResources;

/// Total slots per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBudget {
    pub launch_slots: usize,
    pub run_slots: usize,
}

impl SlotBudget {
    /// At least one slot of each kind.
    pub fn new(launch_slots: usize, run_slots: usize) -> Self {
        Self {
            launch_slots: launch_slots.max(1),
            run_slots: run_slots.max(1),
        }
    }

    /// `ceil(k * vcpus)` launch slots and `floor(memory / footprint)` run slots.
    pub fn from_host(host: &HostResources, launch_slots_per_cpu: f64, job_memory_bytes: u64) -> Self {
        let launch = (launch_slots_per_cpu * f64::from(host.cpus)).ceil() as usize;
        let run = host
            .memory_bytes
            .checked_div(job_memory_bytes)
            .unwrap_or(0) as usize;
        Self::new(launch, run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Launch,
    Run,
}

impl SlotKind {
    /// Job state that holding this slot implies.
    fn state(self) -> JobState {
        match self {
            Self::Launch => JobState::Launching,
            Self::Run => JobState::Running,
        }
    }
}

/// Snapshot of the slot counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub total_launch_slots: usize,
    pub total_run_slots: usize,
    pub used_launch_slots: usize,
    pub used_run_slots: usize,
}

#[derive(Debug, Default)]
struct Slots {
    held: HashMap<JobId, SlotKind>,
}

impl Slots {
    fn used(&self, kind: SlotKind) -> usize {
        self.held.values().filter(|k| **k == kind).count()
    }
}

pub struct AdmissionController {
    store: Arc<JobStore>,
    budget: SlotBudget,
    slots: Mutex<Slots>,
}

impl AdmissionController {
    /// Create the controller, counting slots held by jobs already
    /// `Launching` or `Running` in the store.
    pub fn new(store: Arc<JobStore>, budget: SlotBudget) -> Result<Self, StoreError> {
        let mut slots = Slots::default();
        for kind in [SlotKind::Launch, SlotKind::Run] {
            for record in store.list_by_state(kind.state())? {
                slots.held.insert(record.job_id, kind);
            }
        }

        info!(
            launch_slots = budget.launch_slots,
            run_slots = budget.run_slots,
            used_launch_slots = slots.used(SlotKind::Launch),
            used_run_slots = slots.used(SlotKind::Run),
            "Admission budget initialized"
        );

        Ok(Self {
            store,
            budget,
            slots: Mutex::new(slots),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn usage(&self) -> SlotUsage {
        let slots = self.lock();
        SlotUsage {
            total_launch_slots: self.budget.launch_slots,
            total_run_slots: self.budget.run_slots,
            used_launch_slots: slots.used(SlotKind::Launch),
            used_run_slots: slots.used(SlotKind::Run),
        }
    }

    pub fn free_launch_slots(&self) -> usize {
        self.budget
            .launch_slots
            .saturating_sub(self.lock().used(SlotKind::Launch))
    }

    pub fn free_run_slots(&self) -> usize {
        self.budget
            .run_slots
            .saturating_sub(self.lock().used(SlotKind::Run))
    }

    /// Slot currently held by a job.
    pub fn held_by(&self, job_id: JobId) -> Option<SlotKind> {
        self.lock().held.get(&job_id).copied()
    }

    /// Take a launch slot and move the job from `Pending` or `Recovering`
    /// to `Launching`.
    ///
    /// Returns `Ok(false)` without side effects when the launch budget is
    /// full or the job is not waiting for admission any more.
    pub fn try_acquire_launch(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut slots = self.lock();
        if slots.held.contains_key(&job_id) || slots.used(SlotKind::Launch) >= self.budget.launch_slots {
            return Ok(false);
        }

        let record = self.store.get(job_id)?;
        if !record.state.is_admissible() || record.cancel_requested {
            return Ok(false);
        }

        match self.store.transition(
            job_id,
            record.state,
            StateUpdate::to(JobState::Launching).reason("admitted"),
        ) {
            Ok(_) => {
                slots.held.insert(job_id, SlotKind::Launch);
                debug!(job_id = %job_id, from = %record.state, "Launch slot acquired");
                Ok(true)
            }
            Err(e) if e.is_stale() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Swap the job's launch slot for a run slot and move it to `Running`.
    ///
    /// Returns `Ok(false)` if no run slot is free or the job is no longer
    /// `Launching`; in the first case it keeps its launch slot.
    pub fn promote_to_run(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut slots = self.lock();
        if slots.held.get(&job_id) != Some(&SlotKind::Launch)
            || slots.used(SlotKind::Run) >= self.budget.run_slots
        {
            return Ok(false);
        }

        match self.store.transition(
            job_id,
            JobState::Launching,
            StateUpdate::to(JobState::Running).reason("promoted"),
        ) {
            Ok(_) => {
                slots.held.insert(job_id, SlotKind::Run);
                debug!(job_id = %job_id, "Promoted to run slot");
                Ok(true)
            }
            Err(e) if e.is_stale() => {
                slots.held.remove(&job_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release whichever slot the job holds.
    pub fn release(&self, job_id: JobId) -> Option<SlotKind> {
        let released = self.lock().held.remove(&job_id);
        if let Some(kind) = released {
            debug!(job_id = %job_id, slot = ?kind, "Slot released");
        }
        released
    }

    /// Drop slots of jobs whose stored state no longer matches the slot.
    ///
    /// Returns the number of slots released.
    pub fn refresh(&self) -> Result<usize, StoreError> {
        let mut slots = self.lock();
        let mut stale = Vec::new();

        for (job_id, kind) in slots.held.iter() {
            match self.store.get(*job_id) {
                Ok(record) if record.state == kind.state() => {}
                Ok(_) | Err(StoreError::NotFound(_)) => stale.push(*job_id),
                Err(e) => return Err(e),
            }
        }

        for job_id in &stale {
            slots.held.remove(job_id);
            debug!(job_id = %job_id, "Slot released after state change");
        }
        Ok(stale.len())
    }
}
