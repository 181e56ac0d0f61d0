use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    store::SchedulerStore,
    types::{JobDefinition, RunRecord, RunState, ScheduleState},
};

const JOB_COLUMNS: &str = "id, name, enabled, schedule, timezone, jitter_ms, not_before,
     not_after, catchup, concurrency, action, created_at, updated_at";
const SCHEDULE_COLUMNS: &str =
    "job_id, next_due, last_scheduled, last_attempt, last_success, updated_at";
const RUN_COLUMNS: &str = "id, job_id, scheduled_at, manual, attempt, state, started_at,
     completed_at, error_code, error_message, resource_usage, created_at";

/// SQLite-backed [`SchedulerStore`].
///
/// Wraps a single connection in a `Mutex`; each call holds it for one short
/// statement, which is plenty for a single-node scheduler.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap `conn`, creating the scheduler tables if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }
}

#[async_trait]
impl SchedulerStore for SqliteStore {
    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM cron_jobs WHERE id = ?1"),
                [id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM cron_jobs ORDER BY created_at"
        ))?;
        let raws = stmt
            .query_map([], RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawJob::into_job).collect()
    }

    async fn save_job(&self, job: &JobDefinition) -> Result<()> {
        let jitter_ms = i64::try_from(job.jitter_ms).map_err(|_| {
            SchedulerError::InvalidSchedule(format!("jitter_ms {} is out of range", job.jitter_ms))
        })?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cron_jobs
             (id, name, enabled, schedule, timezone, jitter_ms, not_before, not_after,
              catchup, concurrency, action, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                job.id,
                job.name,
                job.enabled as i64,
                job.schedule,
                job.timezone,
                jitter_ms,
                job.not_before.map(ts),
                job.not_after.map(ts),
                job.catchup as i64,
                job.concurrency.as_str(),
                serde_json::to_string(&job.action)?,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_schedule(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM cron_schedules WHERE job_id = ?1"),
                [job_id],
                RawSchedule::from_row,
            )
            .optional()?;
        raw.map(RawSchedule::into_schedule).transpose()
    }

    async fn save_schedule(&self, schedule: &ScheduleState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cron_schedules
             (job_id, next_due, last_scheduled, last_attempt, last_success, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                schedule.job_id,
                schedule.next_due.map(ts),
                schedule.last_scheduled.map(ts),
                schedule.last_attempt.map(ts),
                schedule.last_success.map(ts),
                ts(schedule.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM cron_schedules
             WHERE next_due IS NOT NULL AND next_due <= ?1
             ORDER BY next_due"
        ))?;
        let raws = stmt
            .query_map([ts(now)], RawSchedule::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSchedule::into_schedule).collect()
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM cron_runs WHERE id = ?1"),
                [id],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cron_runs
             (id, job_id, scheduled_at, manual, attempt, state, started_at, completed_at,
              error_code, error_message, resource_usage, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                run.id,
                run.job_id,
                ts(run.scheduled_at),
                run.manual as i64,
                run.attempt,
                run.state.to_string(),
                run.started_at.map(ts),
                run.completed_at.map(ts),
                run.error_code,
                run.error_message,
                serde_json::to_string(&run.resource_usage)?,
                ts(run.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_runs(&self, job_id: Option<&str>) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let raws = match job_id {
            Some(job_id) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {RUN_COLUMNS} FROM cron_runs
                     WHERE job_id = ?1 ORDER BY scheduled_at, created_at"
                ))?;
                let rows = stmt
                    .query_map([job_id], RawRun::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {RUN_COLUMNS} FROM cron_runs ORDER BY scheduled_at, created_at"
                ))?;
                let rows = stmt
                    .query_map([], RawRun::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        raws.into_iter().map(RawRun::into_run).collect()
    }
}

// --- row decoding --------------------------------------------------------
//
// Rows are read as plain SQL values first and interpreted afterwards, so a
// malformed timestamp or state surfaces as `Corrupt` instead of a rusqlite
// conversion error.

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

struct RawJob {
    id: String,
    name: String,
    enabled: i64,
    schedule: String,
    timezone: Option<String>,
    jitter_ms: i64,
    not_before: Option<String>,
    not_after: Option<String>,
    catchup: i64,
    concurrency: String,
    action: String,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
            schedule: row.get(3)?,
            timezone: row.get(4)?,
            jitter_ms: row.get(5)?,
            not_before: row.get(6)?,
            not_after: row.get(7)?,
            catchup: row.get(8)?,
            concurrency: row.get(9)?,
            action: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<JobDefinition> {
        Ok(JobDefinition {
            id: self.id,
            name: self.name,
            enabled: self.enabled != 0,
            schedule: self.schedule,
            timezone: self.timezone,
            jitter_ms: u64::try_from(self.jitter_ms).map_err(|_| {
                SchedulerError::Corrupt(format!("negative jitter_ms {}", self.jitter_ms))
            })?,
            not_before: parse_opt_ts(self.not_before)?,
            not_after: parse_opt_ts(self.not_after)?,
            catchup: self.catchup != 0,
            concurrency: self.concurrency.into(),
            action: serde_json::from_str(&self.action)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawSchedule {
    job_id: String,
    next_due: Option<String>,
    last_scheduled: Option<String>,
    last_attempt: Option<String>,
    last_success: Option<String>,
    updated_at: String,
}

impl RawSchedule {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            next_due: row.get(1)?,
            last_scheduled: row.get(2)?,
            last_attempt: row.get(3)?,
            last_success: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_schedule(self) -> Result<ScheduleState> {
        Ok(ScheduleState {
            job_id: self.job_id,
            next_due: parse_opt_ts(self.next_due)?,
            last_scheduled: parse_opt_ts(self.last_scheduled)?,
            last_attempt: parse_opt_ts(self.last_attempt)?,
            last_success: parse_opt_ts(self.last_success)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawRun {
    id: String,
    job_id: String,
    scheduled_at: String,
    manual: i64,
    attempt: u32,
    state: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    resource_usage: String,
    created_at: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            scheduled_at: row.get(2)?,
            manual: row.get(3)?,
            attempt: row.get(4)?,
            state: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
            resource_usage: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<RunRecord> {
        let state: RunState = self.state.parse().map_err(SchedulerError::Corrupt)?;
        Ok(RunRecord {
            id: self.id,
            job_id: self.job_id,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            manual: self.manual != 0,
            attempt: self.attempt,
            state,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error_code: self.error_code,
            error_message: self.error_message,
            resource_usage: serde_json::from_str(&self.resource_usage)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
