//! SQLite-based job record store.
//!
//! The store is the single source of truth shared by the scheduler, every
//! job controller and the recovery sweep, possibly from different processes.
//! Each process opens its own connection on the same database file. Every
//! write runs in an `IMMEDIATE` transaction and state changes are
//! compare-and-swap updates keyed on the expected prior state and the row
//! version, so concurrent writers never need an application-level lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::StoreError;
use crate::record::{CancelOutcome, JobId, JobRecord, JobTransition, NewJob, StateUpdate};
use crate::state::JobState;

/// File name of the job database inside the data directory.
pub const DB_FILE_NAME: &str = "jobs.db";

/// How long a writer waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "job_id, name, state, resources_descriptor, submitted_at, \
    state_updated_at, ended_at, controller_pid, retry_count, failure_reason, \
    cancel_requested, cluster_handle, launch_ready, next_attempt_at, version";

/// Resolve the data directory: `MJOBS_DATA_DIR`, else the platform default.
pub fn default_data_dir() -> Result<PathBuf, StoreError> {
    if let Ok(dir) = std::env::var("MJOBS_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }

    directories::ProjectDirs::from("dev", "mjobs", "mjobs")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StoreError::NoDataDir)
}

/// Durable job table.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Invalid(format!("create {parent:?}: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets controllers read while another process writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the store inside a data directory.
    pub fn open_in_dir<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        Self::open(data_dir.as_ref().join(DB_FILE_NAME))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied write:
        // uncommitted transactions roll back on drop.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a new job in `Pending` and return its id.
    pub fn create(&self, job: &NewJob) -> Result<JobId, StoreError> {
        if job.resources_descriptor.trim().is_empty() {
            return Err(StoreError::Invalid(
                "resources descriptor must not be empty".to_string(),
            ));
        }

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        tx.execute(
            "INSERT INTO jobs (name, state, resources_descriptor, submitted_at, state_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                job.name,
                JobState::Pending.as_str(),
                job.resources_descriptor,
                now
            ],
        )?;
        let job_id = JobId::new(tx.last_insert_rowid());
        insert_transition(&tx, job_id, None, JobState::Pending, now, Some("submitted"))?;
        tx.commit()?;

        debug!(job_id = %job_id, name = ?job.name, "Job created");
        Ok(job_id)
    }

    /// Get a job record.
    pub fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let conn = self.lock();
        load_record(&conn, job_id)?.ok_or(StoreError::NotFound(job_id))
    }

    /// Compare-and-swap the state of a job.
    ///
    /// Succeeds only if the stored state equals `expected`; otherwise returns
    /// [`StoreError::StaleState`] and leaves the record untouched.
    pub fn update_state(
        &self,
        job_id: JobId,
        expected: JobState,
        new_state: JobState,
    ) -> Result<JobRecord, StoreError> {
        self.transition(job_id, expected, StateUpdate::to(new_state))
    }

    /// Compare-and-swap the state of a job together with its side fields.
    pub fn transition(
        &self,
        job_id: JobId,
        expected: JobState,
        update: StateUpdate,
    ) -> Result<JobRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_record(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        if current.state != expected {
            return Err(StoreError::StaleState {
                job_id,
                expected,
                actual: current.state,
            });
        }
        if !expected.can_transition_to(update.to) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: expected,
                to: update.to,
            });
        }

        let failure_reason = if update.to == JobState::Failed {
            match update.failure_reason.as_deref().map(str::trim) {
                Some(reason) if !reason.is_empty() => Some(reason.to_string()),
                _ => {
                    return Err(StoreError::Invalid(format!(
                        "job {job_id}: failed state requires a failure reason"
                    )))
                }
            }
        } else {
            None
        };

        let retry_count = update.retry_count.unwrap_or(current.retry_count);
        if retry_count < current.retry_count {
            return Err(StoreError::Invalid(format!(
                "job {job_id}: retry count cannot decrease ({} -> {retry_count})",
                current.retry_count
            )));
        }

        let now = now_millis();
        let ended_at = update.to.is_terminal().then_some(now);
        let next_attempt_at = update.next_attempt_at.map(|at| at.timestamp_millis());

        let rows = tx.execute(
            "UPDATE jobs SET
                state = ?1,
                state_updated_at = ?2,
                ended_at = ?3,
                retry_count = ?4,
                failure_reason = ?5,
                next_attempt_at = ?6,
                launch_ready = 0,
                cluster_handle = CASE WHEN ?7 THEN NULL ELSE cluster_handle END,
                version = version + 1
             WHERE job_id = ?8 AND state = ?9 AND version = ?10",
            params![
                update.to.as_str(),
                now,
                ended_at,
                retry_count,
                failure_reason,
                next_attempt_at,
                update.clear_cluster,
                job_id.get(),
                expected.as_str(),
                current.version,
            ],
        )?;
        if rows == 0 {
            let actual = load_record(&tx, job_id)?
                .map(|r| r.state)
                .unwrap_or(current.state);
            return Err(StoreError::StaleState {
                job_id,
                expected,
                actual,
            });
        }

        insert_transition(
            &tx,
            job_id,
            Some(expected),
            update.to,
            now,
            update.reason.as_deref(),
        )?;
        let record = load_record(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        tx.commit()?;

        debug!(
            job_id = %job_id,
            from = %expected,
            to = %update.to,
            retry_count,
            "Job state committed"
        );
        Ok(record)
    }

    /// List jobs in a state, oldest submission first.
    pub fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        query_records(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY submitted_at, job_id"
            ),
            params![state.as_str()],
        )
    }

    /// List all jobs, optionally hiding finished ones.
    pub fn list(&self, skip_finished: bool) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        let sql = if skip_finished {
            format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state NOT IN ('succeeded', 'failed', 'cancelled')
                 ORDER BY submitted_at, job_id"
            )
        } else {
            format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY submitted_at, job_id")
        };
        query_records(&conn, &sql, [])
    }

    /// Jobs waiting for a launch slot whose backoff has elapsed, in
    /// first-submitted-first-admitted order.
    pub fn list_admissible(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        query_records(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state IN ('pending', 'recovering')
                   AND cancel_requested = 0
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY submitted_at, job_id"
            ),
            params![now.timestamp_millis()],
        )
    }

    /// Launched jobs waiting for a run slot, in submission order.
    pub fn list_awaiting_promotion(&self) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        query_records(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state = 'launching' AND launch_ready = 1 AND cancel_requested = 0
                 ORDER BY submitted_at, job_id"
            ),
            [],
        )
    }

    /// Non-terminal jobs with a pending cancellation request.
    pub fn list_cancel_requested(&self) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        query_records(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE cancel_requested = 1
                   AND state NOT IN ('succeeded', 'failed', 'cancelled')
                 ORDER BY submitted_at, job_id"
            ),
            [],
        )
    }

    /// Count jobs in a state.
    pub fn count_by_state(&self, state: JobState) -> Result<usize, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Jobs carrying the given name, oldest first.
    pub fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock();
        query_records(
            &conn,
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 ORDER BY submitted_at, job_id"),
            params![name],
        )
    }

    /// Raise the cancellation flag on a job.
    pub fn request_cancel(&self, job_id: JobId) -> Result<CancelOutcome, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = request_cancel_in(&tx, job_id)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Cancel the single unfinished job carrying `name`.
    pub fn request_cancel_by_name(
        &self,
        name: &str,
    ) -> Result<(JobId, CancelOutcome), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let matches = query_records(
            &tx,
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 ORDER BY submitted_at, job_id"),
            params![name],
        )?;
        let unfinished: Vec<JobId> = matches
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.job_id)
            .collect();

        let job_id = match (unfinished.as_slice(), matches.last()) {
            ([job_id], _) => *job_id,
            ([], Some(latest)) => return Ok((latest.job_id, CancelOutcome::AlreadyTerminal(latest.state))),
            ([], None) => return Err(StoreError::NameNotFound(name.to_string())),
            (ids, _) => {
                return Err(StoreError::AmbiguousName {
                    name: name.to_string(),
                    ids: ids.to_vec(),
                })
            }
        };

        let outcome = request_cancel_in(&tx, job_id)?;
        tx.commit()?;
        Ok((job_id, outcome))
    }

    /// Raise the cancellation flag on every unfinished job.
    pub fn request_cancel_all(&self) -> Result<Vec<JobId>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT job_id FROM jobs
                 WHERE cancel_requested = 0
                   AND state NOT IN ('succeeded', 'failed', 'cancelled')
                 ORDER BY job_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0).map(JobId::new))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        tx.execute(
            "UPDATE jobs SET cancel_requested = 1, version = version + 1
             WHERE cancel_requested = 0
               AND state NOT IN ('succeeded', 'failed', 'cancelled')",
            [],
        )?;
        tx.commit()?;

        Ok(ids)
    }

    /// Bind a controller process to a job.
    pub fn set_controller(&self, job_id: JobId, pid: u32) -> Result<(), StoreError> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE jobs SET controller_pid = ?1, version = version + 1 WHERE job_id = ?2",
            params![pid, job_id.get()],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    /// Unbind a controller, but only if `pid` is still the bound one.
    pub fn clear_controller(&self, job_id: JobId, pid: u32) -> Result<bool, StoreError> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE jobs SET controller_pid = NULL, version = version + 1
             WHERE job_id = ?1 AND controller_pid = ?2",
            params![job_id.get(), pid],
        )?;
        Ok(rows > 0)
    }

    /// Record a successful launch; the job then waits for promotion.
    ///
    /// Only valid while the job is `Launching`.
    pub fn record_launch(&self, job_id: JobId, cluster_handle: &str) -> Result<JobRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_record(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        if current.state != JobState::Launching {
            return Err(StoreError::StaleState {
                job_id,
                expected: JobState::Launching,
                actual: current.state,
            });
        }

        tx.execute(
            "UPDATE jobs SET cluster_handle = ?1, launch_ready = 1, version = version + 1
             WHERE job_id = ?2",
            params![cluster_handle, job_id.get()],
        )?;
        let record = load_record(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
        tx.commit()?;
        Ok(record)
    }

    /// Forget the cluster handle of a job.
    pub fn clear_cluster(&self, job_id: JobId) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET cluster_handle = NULL, version = version + 1 WHERE job_id = ?1",
            params![job_id.get()],
        )?;
        Ok(())
    }

    /// Transition history of a job, oldest first.
    pub fn history(&self, job_id: JobId) -> Result<Vec<JobTransition>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, from_state, to_state, at, reason
             FROM job_transitions WHERE job_id = ?1 ORDER BY id",
        )?;

        let transitions = stmt
            .query_map(params![job_id.get()], |row| {
                let from_state: Option<String> = row.get(1)?;
                let from_state = from_state
                    .map(|s| parse_state(&s, 1))
                    .transpose()?;
                let to_state: String = row.get(2)?;

                Ok(JobTransition {
                    job_id: JobId::new(row.get(0)?),
                    from_state,
                    to_state: parse_state(&to_state, 2)?,
                    at: from_millis(row.get(3)?),
                    reason: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(transitions)
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            state TEXT NOT NULL,
            resources_descriptor TEXT NOT NULL,
            submitted_at INTEGER NOT NULL,
            state_updated_at INTEGER NOT NULL,
            ended_at INTEGER,
            controller_pid INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            cluster_handle TEXT,
            launch_ready INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER,
            version INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, submitted_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs(name);

        CREATE TABLE IF NOT EXISTS job_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL REFERENCES jobs(job_id),
            from_state TEXT,
            to_state TEXT NOT NULL,
            at INTEGER NOT NULL,
            reason TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_job_transitions_job ON job_transitions(job_id, id);
        "#,
    )?;

    debug!("Job store schema initialized");
    Ok(())
}

fn request_cancel_in(conn: &Connection, job_id: JobId) -> Result<CancelOutcome, StoreError> {
    let current = load_record(conn, job_id)?.ok_or(StoreError::NotFound(job_id))?;
    if current.state.is_terminal() {
        return Ok(CancelOutcome::AlreadyTerminal(current.state));
    }
    if current.cancel_requested {
        return Ok(CancelOutcome::AlreadyRequested);
    }

    conn.execute(
        "UPDATE jobs SET cancel_requested = 1, version = version + 1 WHERE job_id = ?1",
        params![job_id.get()],
    )?;
    debug!(job_id = %job_id, state = %current.state, "Cancellation requested");
    Ok(CancelOutcome::Requested)
}

fn insert_transition(
    conn: &Connection,
    job_id: JobId,
    from: Option<JobState>,
    to: JobState,
    at: i64,
    reason: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO job_transitions (job_id, from_state, to_state, at, reason)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id.get(), from.map(|s| s.as_str()), to.as_str(), at, reason],
    )?;
    Ok(())
}

fn load_record(conn: &Connection, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
        params![job_id.get()],
        row_to_record,
    )
    .optional()
    .map_err(Into::into)
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<JobRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let records = stmt
        .query_map(params, row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let state: String = row.get(2)?;

    Ok(JobRecord {
        job_id: JobId::new(row.get(0)?),
        name: row.get(1)?,
        state: parse_state(&state, 2)?,
        resources_descriptor: row.get(3)?,
        submitted_at: from_millis(row.get(4)?),
        state_updated_at: from_millis(row.get(5)?),
        ended_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        controller_pid: row.get(7)?,
        retry_count: row.get(8)?,
        failure_reason: row.get(9)?,
        cancel_requested: row.get(10)?,
        cluster_handle: row.get(11)?,
        launch_ready: row.get(12)?,
        next_attempt_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        version: row.get(14)?,
    })
}

fn parse_state(s: &str, column: usize) -> rusqlite::Result<JobState> {
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
