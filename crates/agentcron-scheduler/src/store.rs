use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    types::{JobDefinition, RunRecord, ScheduleState},
};

/// Durable storage consumed by the scheduler.
///
/// Every method is a point lookup, a list query or a single-entity upsert;
/// the scheduler never needs multi-row transactions. Missing rows are `None`,
/// not errors.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>>;

    /// All job definitions, in no particular order.
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>>;

    /// Insert or replace a job definition.
    async fn save_job(&self, job: &JobDefinition) -> Result<()>;

    async fn get_schedule(&self, job_id: &str) -> Result<Option<ScheduleState>>;

    /// Insert or replace the schedule state of `schedule.job_id`.
    async fn save_schedule(&self, schedule: &ScheduleState) -> Result<()>;

    /// Every schedule whose `next_due` is at or before `now`.
    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>>;

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;

    /// Insert or replace a run record.
    async fn save_run(&self, run: &RunRecord) -> Result<()>;

    /// All runs, or only those of `job_id`, oldest occurrence first.
    async fn list_runs(&self, job_id: Option<&str>) -> Result<Vec<RunRecord>>;
}
