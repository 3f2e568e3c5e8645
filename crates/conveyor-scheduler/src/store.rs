use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument};

use crate::{
    db::{from_sql_ts, init_db, to_sql_ts},
    error::{Result, SchedulerError},
    types::{JobParameters, JobRecord, JobStatus},
};

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A status transition plus the fields that travel with it.
///
/// Every transition is conditional on the source statuses listed on its
/// variant; [`JobStore::update_status`] returns `false` when the record was no
/// longer in one of them. This is what keeps terminal records frozen and lets
/// racing components lose quietly.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// PENDING → QUEUED once the trigger date has passed.
    Activate { at: DateTime<Utc> },
    /// TO_BE_RUN → QUEUED when the pool could not take a claimed job.
    Requeue { at: DateTime<Utc> },
    /// TO_BE_RUN → RUNNING; sets the start date and first heartbeat.
    Start { at: DateTime<Utc> },
    /// RUNNING → SUCCEEDED with the work's result.
    Succeed {
        at: DateTime<Utc>,
        result: serde_json::Value,
    },
    /// TO_BE_RUN | RUNNING → FAILED.
    Fail { at: DateTime<Utc>, reason: String },
    /// PENDING | QUEUED | TO_BE_RUN → ABORTED, before any work started.
    Withdraw { at: DateTime<Utc> },
    /// RUNNING → ABORTED after the work stopped on request.
    Abort { at: DateTime<Utc> },
}

impl StatusUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            StatusUpdate::Activate { .. } | StatusUpdate::Requeue { .. } => JobStatus::Queued,
            StatusUpdate::Start { .. } => JobStatus::Running,
            StatusUpdate::Succeed { .. } => JobStatus::Succeeded,
            StatusUpdate::Fail { .. } => JobStatus::Failed,
            StatusUpdate::Withdraw { .. } | StatusUpdate::Abort { .. } => JobStatus::Aborted,
        }
    }
}

/// Durable job storage consumed by every scheduler component.
///
/// Implementations must make [`claim_highest_priority_queued`] atomic across
/// every caller sharing the same backing data, including other processes.
///
/// [`claim_highest_priority_queued`]: JobStore::claim_highest_priority_queued
pub trait JobStore: Send + Sync {
    fn insert(&self, job: &JobRecord) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Move the highest-priority QUEUED job of `tenant` (oldest first among
    /// equals) to TO_BE_RUN and return it. `None` when nothing is queued or a
    /// concurrent caller won the race.
    fn claim_highest_priority_queued(&self, tenant: &str) -> Result<Option<JobRecord>>;

    /// Apply a conditional transition. `Ok(false)` means the record was not
    /// in a valid source status.
    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool>;

    /// Raise `percent_completed` (never lowers it) and refresh the heartbeat
    /// of a RUNNING job. `Ok(false)` when the job is not running.
    fn record_progress(
        &self,
        id: &str,
        percent: u8,
        estimated_completion: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Refresh the heartbeat of a RUNNING job.
    fn heartbeat(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Set `cancel_requested` unless the job is terminal, then return the
    /// current record. `None` for unknown ids.
    fn request_cancel(&self, id: &str) -> Result<Option<JobRecord>>;

    fn count_running_or_to_be_run(&self, tenant: &str) -> Result<usize>;

    /// RUNNING jobs whose last heartbeat is older than `threshold`.
    fn find_stale_running(
        &self,
        tenant: &str,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    /// PENDING jobs whose trigger date is at or before `now`.
    fn find_due_pending(&self, tenant: &str, now: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// Non-terminal jobs with a stop request.
    fn find_cancel_requested(&self, tenant: &str) -> Result<Vec<JobRecord>>;

    fn find_by_status(&self, tenant: &str, status: JobStatus) -> Result<Vec<JobRecord>>;

    /// Tenants owning at least one non-terminal job.
    fn active_tenants(&self) -> Result<Vec<String>>;
}

/// Tenants the periodic loops visit: configured ones plus any with live jobs.
pub(crate) fn known_tenants(store: &dyn JobStore, configured: &[String]) -> Result<Vec<String>> {
    let mut tenants: BTreeSet<String> = configured.iter().cloned().collect();
    tenants.extend(store.active_tenants()?);
    Ok(tenants.into_iter().collect())
}

const SELECT_COLUMNS: &str = "id, tenant, job_type, parameters, priority, status,
        percent_completed, estimated_completion, last_heartbeat, expiration_date,
        trigger_date, start_date, stop_date, result, error_detail, cancel_requested,
        created_at, updated_at";

/// [`JobStore`] backed by SQLite.
///
/// One connection per store behind a `Mutex`. Several stores (or processes)
/// may open the same database file; the claim runs in an IMMEDIATE
/// transaction so SQLite's write lock serialises competing claimers.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Private in-memory database, used by tests and throwaway schedulers.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written;
        // keep serving from the same connection.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id, tenant = %job.tenant))]
    fn insert(&self, job: &JobRecord) -> Result<()> {
        let parameters = serde_json::to_string(&job.parameters)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs
             (id, tenant, job_type, parameters, priority, status, percent_completed,
              estimated_completion, last_heartbeat, expiration_date, trigger_date,
              start_date, stop_date, result, error_detail, cancel_requested,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            rusqlite::params![
                job.id,
                job.tenant,
                job.job_type,
                parameters,
                job.priority,
                job.status.as_str(),
                job.percent_completed,
                job.estimated_completion.map(to_sql_ts),
                job.last_heartbeat.map(to_sql_ts),
                job.expiration_date.map(to_sql_ts),
                job.trigger_date.map(to_sql_ts),
                job.start_date.map(to_sql_ts),
                job.stop_date.map(to_sql_ts),
                result,
                job.error_detail,
                job.cancel_requested,
                to_sql_ts(job.created_at),
                to_sql_ts(job.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    #[instrument(level = "debug", skip(self))]
    fn claim_highest_priority_queued(&self, tenant: &str) -> Result<Option<JobRecord>> {
        let now = to_sql_ts(crate::types::now());
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'to_be_run', updated_at = ?2
                     WHERE seq = (SELECT seq FROM jobs
                                  WHERE tenant = ?1 AND status = 'queued'
                                  ORDER BY priority DESC, seq ASC
                                  LIMIT 1)
                       AND status = 'queued'
                     RETURNING {SELECT_COLUMNS}"
                ),
                rusqlite::params![tenant, now],
                JobRow::from_row,
            )
            .optional()?;
        tx.commit()?;
        let claimed = row.map(JobRow::into_record).transpose()?;
        if let Some(ref job) = claimed {
            debug!(job_id = %job.id, priority = job.priority, "job claimed");
        }
        Ok(claimed)
    }

    #[instrument(level = "debug", skip(self, update), fields(status = %update.target()))]
    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool> {
        let conn = self.conn();
        let changed = match update {
            StatusUpdate::Activate { at } => conn.execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![id, to_sql_ts(*at)],
            )?,
            StatusUpdate::Requeue { at } => conn.execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?2
                 WHERE id = ?1 AND status = 'to_be_run'",
                rusqlite::params![id, to_sql_ts(*at)],
            )?,
            StatusUpdate::Start { at } => conn.execute(
                "UPDATE jobs SET status = 'running', start_date = ?2, last_heartbeat = ?2,
                        updated_at = ?2
                 WHERE id = ?1 AND status = 'to_be_run'",
                rusqlite::params![id, to_sql_ts(*at)],
            )?,
            StatusUpdate::Succeed { at, result } => conn.execute(
                "UPDATE jobs SET status = 'succeeded', percent_completed = 100,
                        estimated_completion = ?2, result = ?3, stop_date = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                rusqlite::params![id, to_sql_ts(*at), serde_json::to_string(result)?],
            )?,
            StatusUpdate::Fail { at, reason } => conn.execute(
                "UPDATE jobs SET status = 'failed', error_detail = ?3, stop_date = ?2,
                        updated_at = ?2
                 WHERE id = ?1 AND status IN ('to_be_run', 'running')",
                rusqlite::params![id, to_sql_ts(*at), reason],
            )?,
            StatusUpdate::Withdraw { at } => conn.execute(
                "UPDATE jobs SET status = 'aborted', stop_date = ?2, updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'queued', 'to_be_run')",
                rusqlite::params![id, to_sql_ts(*at)],
            )?,
            StatusUpdate::Abort { at } => conn.execute(
                "UPDATE jobs SET status = 'aborted', stop_date = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                rusqlite::params![id, to_sql_ts(*at)],
            )?,
        };
        Ok(changed > 0)
    }

    fn record_progress(
        &self,
        id: &str,
        percent: u8,
        estimated_completion: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        // SET expressions see the pre-update row, so the CASE compares against
        // the stored percentage.
        let changed = conn.execute(
            "UPDATE jobs SET
                 estimated_completion = CASE WHEN ?2 > percent_completed
                                             THEN ?3 ELSE estimated_completion END,
                 percent_completed    = MAX(percent_completed, ?2),
                 last_heartbeat       = ?4,
                 updated_at           = ?4
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![
                id,
                percent.min(100),
                estimated_completion.map(to_sql_ts),
                to_sql_ts(now)
            ],
        )?;
        Ok(changed > 0)
    }

    fn heartbeat(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE jobs SET last_heartbeat = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'running'",
            rusqlite::params![id, to_sql_ts(now)],
        )?;
        Ok(changed > 0)
    }

    #[instrument(level = "debug", skip(self))]
    fn request_cancel(&self, id: &str) -> Result<Option<JobRecord>> {
        {
            let conn = self.conn();
            conn.execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
                 WHERE id = ?1 AND status NOT IN ('succeeded', 'failed', 'aborted')",
                rusqlite::params![id, to_sql_ts(crate::types::now())],
            )?;
        }
        self.get(id)
    }

    fn count_running_or_to_be_run(&self, tenant: &str) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE tenant = ?1 AND status IN ('to_be_run', 'running')",
            [tenant],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    fn find_stale_running(
        &self,
        tenant: &str,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM jobs
                 WHERE tenant = ?1 AND status = 'running'
                   AND (last_heartbeat IS NULL OR last_heartbeat < ?2)
                 ORDER BY seq"
            ),
            rusqlite::params![tenant, to_sql_ts(threshold)],
        )
    }

    fn find_due_pending(&self, tenant: &str, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM jobs
                 WHERE tenant = ?1 AND status = 'pending'
                   AND trigger_date IS NOT NULL AND trigger_date <= ?2
                 ORDER BY seq"
            ),
            rusqlite::params![tenant, to_sql_ts(now)],
        )
    }

    fn find_cancel_requested(&self, tenant: &str) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM jobs
                 WHERE tenant = ?1 AND cancel_requested = 1
                   AND status NOT IN ('succeeded', 'failed', 'aborted')
                 ORDER BY seq"
            ),
            [tenant],
        )
    }

    fn find_by_status(&self, tenant: &str, status: JobStatus) -> Result<Vec<JobRecord>> {
        let conn = self.conn();
        query_records(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM jobs
                 WHERE tenant = ?1 AND status = ?2
                 ORDER BY priority DESC, seq ASC"
            ),
            rusqlite::params![tenant, status.as_str()],
        )
    }

    fn active_tenants(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT tenant FROM jobs
             WHERE status NOT IN ('succeeded', 'failed', 'aborted')
             ORDER BY tenant",
        )?;
        let tenants = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(JobRow::into_record).collect()
}

/// Raw column values, decoded into a [`JobRecord`] outside the row callback
/// so that decode failures can name the offending job.
struct JobRow {
    id: String,
    tenant: String,
    job_type: String,
    parameters: String,
    priority: i32,
    status: String,
    percent_completed: i64,
    estimated_completion: Option<String>,
    last_heartbeat: Option<String>,
    expiration_date: Option<String>,
    trigger_date: Option<String>,
    start_date: Option<String>,
    stop_date: Option<String>,
    result: Option<String>,
    error_detail: Option<String>,
    cancel_requested: bool,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    /// Column order follows [`SELECT_COLUMNS`].
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant: row.get(1)?,
            job_type: row.get(2)?,
            parameters: row.get(3)?,
            priority: row.get(4)?,
            status: row.get(5)?,
            percent_completed: row.get(6)?,
            estimated_completion: row.get(7)?,
            last_heartbeat: row.get(8)?,
            expiration_date: row.get(9)?,
            trigger_date: row.get(10)?,
            start_date: row.get(11)?,
            stop_date: row.get(12)?,
            result: row.get(13)?,
            error_detail: row.get(14)?,
            cancel_requested: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let id = self.id;
        let corrupt = |field: &str, reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason: format!("{field}: {reason}"),
        };
        let ts = |field: &str, value: &str| {
            from_sql_ts(value).map_err(|e| corrupt(field, e.to_string()))
        };
        let opt_ts = |field: &str, value: Option<String>| {
            value.as_deref().map(|v| ts(field, v)).transpose()
        };

        let parameters: JobParameters = serde_json::from_str(&self.parameters)
            .map_err(|e| corrupt("parameters", e.to_string()))?;
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: crate::types::UnknownStatus| corrupt("status", e.to_string()))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("result", e.to_string()))?;

        Ok(JobRecord {
            tenant: self.tenant,
            job_type: self.job_type,
            parameters,
            priority: self.priority,
            status,
            percent_completed: self.percent_completed.clamp(0, 100) as u8,
            estimated_completion: opt_ts("estimated_completion", self.estimated_completion)?,
            last_heartbeat: opt_ts("last_heartbeat", self.last_heartbeat)?,
            expiration_date: opt_ts("expiration_date", self.expiration_date)?,
            trigger_date: opt_ts("trigger_date", self.trigger_date)?,
            start_date: opt_ts("start_date", self.start_date)?,
            stop_date: opt_ts("stop_date", self.stop_date)?,
            result,
            error_detail: self.error_detail,
            cancel_requested: self.cancel_requested,
            created_at: ts("created_at", &self.created_at)?,
            updated_at: ts("updated_at", &self.updated_at)?,
            id,
        })
    }
}


/// Test double that refuses status writes for one job and delegates the rest.
#[cfg(test)]
pub(crate) struct BrokenUpdates {
    pub inner: SqliteJobStore,
    pub broken_id: String,
}

#[cfg(test)]
impl JobStore for BrokenUpdates {
    fn insert(&self, job: &JobRecord) -> Result<()> {
        self.inner.insert(job)
    }

    fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        self.inner.get(id)
    }

    fn claim_highest_priority_queued(&self, tenant: &str) -> Result<Option<JobRecord>> {
        self.inner.claim_highest_priority_queued(tenant)
    }

    fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool> {
        if id == self.broken_id {
            return Err(SchedulerError::CorruptRecord {
                id: id.to_string(),
                reason: "write refused".into(),
            });
        }
        self.inner.update_status(id, update)
    }

    fn record_progress(
        &self,
        id: &str,
        percent: u8,
        estimated_completion: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.record_progress(id, percent, estimated_completion, now)
    }

    fn heartbeat(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.heartbeat(id, now)
    }

    fn request_cancel(&self, id: &str) -> Result<Option<JobRecord>> {
        self.inner.request_cancel(id)
    }

    fn count_running_or_to_be_run(&self, tenant: &str) -> Result<usize> {
        self.inner.count_running_or_to_be_run(tenant)
    }

    fn find_stale_running(
        &self,
        tenant: &str,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        self.inner.find_stale_running(tenant, threshold)
    }

    fn find_due_pending(&self, tenant: &str, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        self.inner.find_due_pending(tenant, now)
    }

    fn find_cancel_requested(&self, tenant: &str) -> Result<Vec<JobRecord>> {
        self.inner.find_cancel_requested(tenant)
    }

    fn find_by_status(&self, tenant: &str, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.inner.find_by_status(tenant, status)
    }

    fn active_tenants(&self) -> Result<Vec<String>> {
        self.inner.active_tenants()
    }
}
