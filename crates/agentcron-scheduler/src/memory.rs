//! In-memory storage implementation.
//!
//! Thread-safe backend for tests and ephemeral deployments. Nothing
//! survives a restart.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{Result, SchedulerError},
    store::SchedulerStore,
    types::{JobDefinition, RunRecord, ScheduleState},
};

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, JobDefinition>>,
    schedules: RwLock<HashMap<String, ScheduleState>>,
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        let jobs = self.jobs.read().map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(jobs.get(id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let jobs = self.jobs.read().map_err(|_| SchedulerError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn save_job(&self, job: &JobDefinition) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|_| SchedulerError::LockPoisoned)?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_schedule(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(schedules.get(job_id).cloned())
    }

    async fn save_schedule(&self, schedule: &ScheduleState) -> Result<()> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        schedules.insert(schedule.job_id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        let mut due: Vec<_> = schedules
            .values()
            .filter(|s| s.next_due.is_some_and(|d| d <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_due);
        Ok(due)
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let runs = self.runs.read().map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(runs.get(id).cloned())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().map_err(|_| SchedulerError::LockPoisoned)?;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self, job_id: Option<&str>) -> Result<Vec<RunRecord>> {
        let runs = self.runs.read().map_err(|_| SchedulerError::LockPoisoned)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| job_id.map_or(true, |id| r.job_id == id))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(result)
    }
}
