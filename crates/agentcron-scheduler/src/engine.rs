use std::sync::Arc;

use agentcron_core::config::DEFAULT_MAX_CATCHUP_RUNS;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::Result,
    lock::JobLocks,
    schedule::DueCalculator,
    store::SchedulerStore,
    types::{JobDefinition, ReconcileReport, RunRecord, ScheduleOutcome, ScheduleState},
};

/// Reconciles persisted schedules against the clock and materializes runs.
///
/// All writes for one job happen under that job's lock, so a reconciliation
/// never interleaves with a lifecycle transition of the same job.
pub struct SchedulingEngine {
    store: Arc<dyn SchedulerStore>,
    calculator: DueCalculator,
    clock: Arc<dyn Clock>,
    locks: Arc<JobLocks>,
    max_catchup_runs: usize,
}

impl SchedulingEngine {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        calculator: DueCalculator,
        clock: Arc<dyn Clock>,
        locks: Arc<JobLocks>,
    ) -> Self {
        Self {
            store,
            calculator,
            clock,
            locks,
            max_catchup_runs: DEFAULT_MAX_CATCHUP_RUNS,
        }
    }

    /// Cap on runs one catch-up pass may create for a single job.
    pub fn with_max_catchup_runs(mut self, max: usize) -> Self {
        self.max_catchup_runs = max;
        self
    }

    pub fn calculator(&self) -> &DueCalculator {
        &self.calculator
    }

    /// Bring one job's schedule up to date with the clock.
    ///
    /// Idempotent: calling it twice at the same instant creates no extra runs
    /// and leaves `next_due` where the first call put it. Disabled jobs are
    /// left untouched.
    pub async fn schedule_job(&self, job: &JobDefinition) -> Result<ScheduleOutcome> {
        let _guard = self.locks.acquire(&job.id).await;
        self.reconcile_locked(job).await
    }

    /// Enabled jobs whose persisted `next_due` has elapsed.
    pub async fn get_due_jobs(&self) -> Result<Vec<JobDefinition>> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for state in self.store.get_due_schedules(now).await? {
            match self.store.get_job(&state.job_id).await? {
                Some(job) if job.enabled => due.push(job),
                Some(_) => debug!(job_id = %state.job_id, "due but disabled"),
                None => debug!(job_id = %state.job_id, "schedule row without a job"),
            }
        }
        Ok(due)
    }

    /// Reconcile every enabled job. One job failing never stops the others.
    pub async fn update_all_schedules(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for job in self.store.list_jobs().await? {
            if !job.enabled {
                continue;
            }
            match self.schedule_job(&job).await {
                Ok(outcome) => report.scheduled.push(outcome),
                Err(e) => {
                    error!(job_id = %job.id, "schedule reconciliation failed: {e}");
                    report.failures.push((job.id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Materialize one run per elapsed `next_due`, then advance the schedule.
    ///
    /// An occurrence that already has a run (from catch-up, or an earlier
    /// tick that died before saving the schedule) is not duplicated. For jobs
    /// that drop missed occurrences, a `next_due` already overtaken by a later
    /// occurrence is stale: it is not fired, only rescheduled.
    pub async fn fire_due_jobs(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for job in self.get_due_jobs().await? {
            match self.fire_job(&job).await {
                Ok(outcome) => report.scheduled.push(outcome),
                Err(e) => {
                    error!(job_id = %job.id, "firing due job failed: {e}");
                    report.failures.push((job.id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn fire_job(&self, job: &JobDefinition) -> Result<ScheduleOutcome> {
        let _guard = self.locks.acquire(&job.id).await;
        let now = self.clock.now();

        let mut fired = 0;
        if let Some(state) = self.store.get_schedule(&job.id).await? {
            // Re-checked under the lock: another tick may have advanced it.
            if let Some(due) = state.next_due.filter(|d| *d <= now) {
                let catches_up = job.catchup && state.last_success.is_some();
                let runs = self.store.list_runs(Some(&job.id)).await?;
                if runs.iter().any(|r| !r.manual && r.scheduled_at == due) {
                    debug!(job_id = %job.id, %due, "occurrence already materialized");
                } else if !catches_up && self.overtaken(job, due, now)? {
                    info!(job_id = %job.id, %due, "stale occurrence dropped");
                } else {
                    self.store.save_run(&RunRecord::due(&job.id, due, now)).await?;
                    info!(job_id = %job.id, %due, "job fired");
                    fired = 1;
                }
            }
        }

        let mut outcome = self.reconcile_locked(job).await?;
        outcome.runs_created += fired;
        Ok(outcome)
    }

    /// Whether another occurrence after `due` has also elapsed by `now`.
    fn overtaken(&self, job: &JobDefinition, due: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let raw = self.calculator.occurrence_after(job, due, false)?;
        Ok(raw.is_some_and(|next| next <= now))
    }

    /// The body of [`schedule_job`](Self::schedule_job); the caller holds the job lock.
    async fn reconcile_locked(&self, job: &JobDefinition) -> Result<ScheduleOutcome> {
        let now = self.clock.now();
        let existing = self.store.get_schedule(&job.id).await?;

        if !job.enabled {
            debug!(job_id = %job.id, "job disabled; schedule left as is");
            return Ok(ScheduleOutcome {
                job_id: job.id.clone(),
                next_due: existing.and_then(|s| s.next_due),
                runs_created: 0,
            });
        }

        let Some(state) = existing else {
            return self.initialize(job, now).await;
        };

        if state.next_due.is_none() {
            if job.updated_at <= state.updated_at {
                debug!(job_id = %job.id, "validity window exhausted");
                self.store.save_schedule(&state).await?;
                return Ok(ScheduleOutcome {
                    job_id: job.id.clone(),
                    next_due: None,
                    runs_created: 0,
                });
            }
            info!(job_id = %job.id, "job edited since its window closed; rescheduling");
            let next = self.calculator.next_due(job, None)?;
            return self.persist(job, state, next, now, 0).await;
        }

        let stored = state.next_due;
        let (next, created) = match state.last_success {
            Some(last_success) if job.catchup => {
                self.catch_up(job, last_success, stored, now).await?
            }
            _ => (self.skip_missed(job, &state, now)?, 0),
        };

        self.persist(job, state, next, now, created).await
    }

    async fn initialize(&self, job: &JobDefinition, now: DateTime<Utc>) -> Result<ScheduleOutcome> {
        let next = self.calculator.next_due(job, None)?;
        if next.is_none() {
            warn!(job_id = %job.id, "job has no occurrence inside its window; not scheduled");
        } else {
            info!(job_id = %job.id, next_due = ?next, "job scheduled");
        }
        self.store
            .save_schedule(&ScheduleState::new(&job.id, next, now))
            .await?;
        Ok(ScheduleOutcome {
            job_id: job.id.clone(),
            next_due: next,
            runs_created: 0,
        })
    }

    /// Create a `Due` run for every occurrence since the last success, up to
    /// and including `now`. Returns the first occurrence after `now` and the
    /// number of runs created.
    async fn catch_up(
        &self,
        job: &JobDefinition,
        last_success: DateTime<Utc>,
        stored: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(Option<DateTime<Utc>>, usize)> {
        // Never re-materialize occurrences that already have a run. Manual
        // runs are not occurrences and do not move the cursor.
        let newest_run = self
            .store
            .list_runs(Some(&job.id))
            .await?
            .into_iter()
            .filter(|r| !r.manual)
            .map(|r| r.scheduled_at)
            .max();
        let mut cursor = newest_run.map_or(last_success, |t| t.max(last_success));

        let mut created = 0;
        let mut candidate = self.calculator.next_due(job, Some(cursor))?;
        while let Some(due) = candidate {
            if due > now {
                break;
            }
            if created >= self.max_catchup_runs {
                warn!(
                    job_id = %job.id,
                    limit = self.max_catchup_runs,
                    "catch-up limit reached; dropping remaining missed occurrences"
                );
                candidate = self.calculator.next_due(job, Some(now))?;
                break;
            }
            self.store.save_run(&RunRecord::due(&job.id, due, now)).await?;
            created += 1;
            cursor = due;
            candidate = self.calculator.next_due(job, Some(cursor))?;
        }

        if created > 0 {
            info!(job_id = %job.id, runs = created, "missed occurrences caught up");
        } else if let Some(kept) = stored.filter(|d| *d > now) {
            return Ok((Some(kept), 0));
        }
        Ok((candidate, created))
    }

    /// Keep a future `next_due`; otherwise drop missed occurrences and keep
    /// only the first one after `now`.
    fn skip_missed(
        &self,
        job: &JobDefinition,
        state: &ScheduleState,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(stored) = state.next_due.filter(|d| *d > now) {
            return Ok(Some(stored));
        }
        let reference = match (state.last_scheduled, state.next_due) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => a.or(b).unwrap_or(now),
        };
        let next = self.calculator.next_due(job, Some(reference))?;
        if next.is_some_and(|d| d <= now) {
            debug!(job_id = %job.id, "missed occurrences dropped");
            return self.calculator.next_due(job, Some(now));
        }
        Ok(next)
    }

    async fn persist(
        &self,
        job: &JobDefinition,
        mut state: ScheduleState,
        next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        runs_created: usize,
    ) -> Result<ScheduleOutcome> {
        if next.is_none() {
            info!(job_id = %job.id, "validity window exhausted");
        }
        state.next_due = next;
        state.updated_at = now;
        self.store.save_schedule(&state).await?;
        Ok(ScheduleOutcome {
            job_id: job.id.clone(),
            next_due: next,
            runs_created,
        })
    }
}
