//! Integration tests for admission and the launch/run lifecycle.

mod common;

use common::Harness;
use mjobs_scheduler::backend::{BackendError, WorkloadStatus};
use mjobs_scheduler::{HostResources, SlotBudget};
use mjobs_store::JobState;

#[tokio::test]
async fn test_thirty_jobs_never_exceed_slot_ceilings() {
    let budget = SlotBudget::from_host(&HostResources::new(4, 8_000_000_000), 4.0, 350_000_000);
    assert_eq!(budget, SlotBudget::new(16, 22));

    let mut h = Harness::new(budget, 3);
    let jobs: Vec<_> = (0..30).map(|i| h.submit(&format!("train-{i}"))).collect();

    let stats = h.scheduler.tick().unwrap();
    assert_eq!(stats.admitted, 16);
    assert_eq!(h.count(JobState::Launching), 16);
    assert_eq!(h.count(JobState::Pending), 14);

    let settled = h
        .run_checked(
            |h| h.count(JobState::Running) == 22 && h.count(JobState::Launching) == 8,
            |h| {
                assert!(h.count(JobState::Launching) <= 16);
                assert!(h.count(JobState::Running) <= 22);
                let usage = h.admission.usage();
                assert!(usage.used_launch_slots <= usage.total_launch_slots);
                assert!(usage.used_run_slots <= usage.total_run_slots);
            },
        )
        .await;
    assert!(settled, "scheduler did not settle at 22 running / 8 launching");

    assert_eq!(h.count(JobState::Pending), 0);
    let usage = h.admission.usage();
    assert_eq!(usage.used_run_slots, 22);
    assert_eq!(usage.used_launch_slots, 8);

    // The oldest submissions got the run slots.
    for job_id in &jobs[..22] {
        assert_eq!(h.state(*job_id), JobState::Running);
    }
    for job_id in &jobs {
        h.assert_valid_path(*job_id);
    }
}

#[tokio::test]
async fn test_admission_is_fifo() {
    let mut h = Harness::new(SlotBudget::new(2, 2), 3);
    let jobs: Vec<_> = (0..5).map(|i| h.submit(&format!("job-{i}"))).collect();

    h.scheduler.tick().unwrap();

    let launching: Vec<_> = h
        .store
        .list_by_state(JobState::Launching)
        .unwrap()
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(launching, jobs[..2].to_vec());
}

#[tokio::test]
async fn test_two_retryable_failures_then_success() {
    let mut h = Harness::new(SlotBudget::new(4, 4), 3);
    h.backend.script_launches(
        "flaky",
        vec![
            Err(BackendError::Retryable("insufficient capacity".into())),
            Err(BackendError::Retryable("insufficient capacity".into())),
        ],
    );
    let job_id = h.submit("flaky");

    assert!(h.run_until(|h| h.state(job_id) == JobState::Running).await);

    assert_eq!(
        h.path(job_id),
        vec![
            JobState::Pending,
            JobState::Launching,
            JobState::Pending,
            JobState::Launching,
            JobState::Pending,
            JobState::Launching,
            JobState::Running,
        ]
    );
    assert_eq!(h.store.get(job_id).unwrap().retry_count, 2);
    assert_eq!(h.backend.launch_attempts("flaky"), 3);
}

#[tokio::test]
async fn test_always_retryable_fails_at_ceiling() {
    let mut h = Harness::new(SlotBudget::new(4, 4), 3);
    h.backend.script_launches(
        "doomed",
        (0..10)
            .map(|_| Err(BackendError::Retryable("zone exhausted".into())))
            .collect(),
    );
    let job_id = h.submit("doomed");

    assert!(h.run_until(|h| h.state(job_id).is_terminal()).await);

    let record = h.store.get(job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.failure_reason.unwrap().contains("zone exhausted"));
    assert_eq!(h.backend.launch_attempts("doomed"), 4);
    h.assert_valid_path(job_id);
}

#[tokio::test]
async fn test_non_retryable_failure_fails_immediately() {
    let mut h = Harness::new(SlotBudget::new(4, 4), 3);
    h.backend.script_launches(
        "broken",
        vec![Err(BackendError::NonRetryable("image not found".into()))],
    );
    let job_id = h.submit("broken");

    assert!(h.run_until(|h| h.state(job_id).is_terminal()).await);

    let record = h.store.get(job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.retry_count, 0);
    assert_eq!(
        h.path(job_id),
        vec![JobState::Pending, JobState::Launching, JobState::Failed]
    );
}

#[tokio::test]
async fn test_completion_frees_run_slot_for_next_job() {
    let mut h = Harness::new(SlotBudget::new(1, 1), 3);
    h.backend
        .script_statuses("short", vec![WorkloadStatus::Running, WorkloadStatus::Succeeded]);
    let first = h.submit("short");
    let second = h.submit("long");

    assert!(
        h.run_checked(
            |h| h.state(second) == JobState::Running,
            |h| assert!(h.count(JobState::Running) <= 1),
        )
        .await
    );

    let record = h.store.get(first).unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert!(record.ended_at.is_some());
    assert_eq!(h.backend.terminated().len(), 1);
    h.assert_valid_path(first);
    h.assert_valid_path(second);
}

#[tokio::test]
async fn test_workload_failure_records_reason() {
    let mut h = Harness::new(SlotBudget::new(2, 2), 3);
    h.backend.script_statuses(
        "oom",
        vec![WorkloadStatus::Failed("exit code 137".to_string())],
    );
    let job_id = h.submit("oom");

    assert!(h.run_until(|h| h.state(job_id).is_terminal()).await);

    let record = h.store.get(job_id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("workload failed: exit code 137"));
    assert_eq!(h.backend.live_clusters(), 0);
}
