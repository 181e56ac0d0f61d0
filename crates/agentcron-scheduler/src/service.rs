use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentcron_core::config::SchedulerConfig;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    admission::AdmissionController,
    clock::Clock,
    engine::SchedulingEngine,
    error::{Result, SchedulerError},
    jitter::JitterSource,
    lifecycle::RunLifecycle,
    lock::{InFlight, JobLocks},
    schedule::{parse_timezone, DueCalculator},
    store::SchedulerStore,
    types::{
        JobDefinition, ReconcileReport, RunRecord, RunState, ScheduleOutcome, TransitionOutcome,
    },
};

/// Everything the scheduler does, wired to one store, clock and lock table.
pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<JobLocks>,
    in_flight: Arc<InFlight>,
    engine: SchedulingEngine,
    lifecycle: Arc<RunLifecycle>,
    admission: Arc<AdmissionController>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn JitterSource>,
    ) -> Result<Self> {
        let default_tz = parse_timezone(&config.default_timezone)?;
        let locks = Arc::new(JobLocks::new());
        let calculator = DueCalculator::new(clock.clone(), jitter, default_tz);
        let engine = SchedulingEngine::new(store.clone(), calculator, clock.clone(), locks.clone())
            .with_max_catchup_runs(config.max_catchup_runs);
        let lifecycle = Arc::new(RunLifecycle::new(store.clone(), clock.clone(), locks.clone()));
        let admission = Arc::new(AdmissionController::new(lifecycle.clone(), locks.clone()));

        Ok(Self {
            store,
            clock,
            locks,
            in_flight: Arc::new(InFlight::new()),
            engine,
            lifecycle,
            admission,
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
        })
    }

    pub fn store(&self) -> &Arc<dyn SchedulerStore> {
        &self.store
    }

    pub fn engine(&self) -> &SchedulingEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> &Arc<RunLifecycle> {
        &self.lifecycle
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn locks(&self) -> &Arc<JobLocks> {
        &self.locks
    }

    /// Runs currently held by the dispatcher fed from [`tick`](Self::tick).
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Persist `job` and reconcile it straight away.
    ///
    /// A definition that cannot be evaluated is rejected before it is stored.
    pub async fn upsert_job(&self, job: &JobDefinition) -> Result<ScheduleOutcome> {
        self.engine.calculator().validate(job)?;
        self.store.save_job(job).await?;
        info!(job_id = %job.id, schedule = %job.schedule, "job saved");
        self.engine.schedule_job(job).await
    }

    /// Create a `Due` run for `job_id` at the current instant, outside its schedule.
    ///
    /// The run is flagged manual, so it never stands in for a missed occurrence.
    pub async fn run_now(&self, job_id: &str) -> Result<RunRecord> {
        let job = self.require_job(job_id).await?;
        let _guard = self.locks.acquire(&job.id).await;
        let run = RunRecord::manual(&job.id, self.clock.now());
        self.store.save_run(&run).await?;
        info!(job_id, run_id = %run.id, "manual run requested");
        Ok(run)
    }

    /// Disable a job. Its schedule row is kept; nothing becomes due.
    pub async fn pause(&self, job_id: &str) -> Result<JobDefinition> {
        self.set_enabled(job_id, false).await
    }

    /// Re-enable a job and reconcile it immediately.
    pub async fn resume(&self, job_id: &str) -> Result<JobDefinition> {
        let job = self.set_enabled(job_id, true).await?;
        self.engine.schedule_job(&job).await?;
        Ok(job)
    }

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<JobDefinition> {
        let mut job = self.require_job(job_id).await?;
        if job.enabled != enabled {
            job.enabled = enabled;
            job.updated_at = self.clock.now();
            self.store.save_job(&job).await?;
            info!(job_id, enabled, "job toggled");
        }
        Ok(job)
    }

    async fn require_job(&self, job_id: &str) -> Result<JobDefinition> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    /// One pass of the scheduler loop.
    ///
    /// Fires elapsed occurrences, reconciles every enabled job, then hands
    /// pending runs of enabled jobs to `fired_tx`: `Due` runs after marking
    /// them SCHEDULED, SCHEDULED runs the dispatcher does not hold (deferred,
    /// or left over from a previous process) as they are. Runs that do not
    /// fit in the channel stay where they are and are retried next tick.
    pub async fn tick(&self, fired_tx: Option<&mpsc::Sender<RunRecord>>) -> Result<ReconcileReport> {
        let mut report = self.engine.fire_due_jobs().await?;
        let reconciled = self.engine.update_all_schedules().await?;
        report.scheduled.extend(reconciled.scheduled);
        report.failures.extend(reconciled.failures);

        let Some(tx) = fired_tx else {
            return Ok(report);
        };
        let mut enabled = HashMap::new();
        for run in self.lifecycle.get_pending_runs().await? {
            if !self.job_enabled(&run.job_id, &mut enabled).await? {
                continue;
            }
            if !self.in_flight.claim(&run.id) {
                continue;
            }
            let run_id = run.id.clone();
            let permit = match tx.try_reserve() {
                Ok(permit) => permit,
                Err(e) => {
                    self.in_flight.release(&run_id);
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!("dispatch channel full; remaining runs wait for the next tick")
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            warn!("dispatch channel closed; runs left pending")
                        }
                    }
                    break;
                }
            };
            let forward = match run.state {
                RunState::Due => match self.lifecycle.mark_run_scheduled(&run_id).await {
                    Ok(TransitionOutcome::Applied(scheduled)) => Some(scheduled),
                    Ok(other) => {
                        debug!(%run_id, ?other, "run not promoted");
                        None
                    }
                    Err(e) => {
                        self.in_flight.release(&run_id);
                        return Err(e);
                    }
                },
                _ => {
                    debug!(%run_id, "forwarding scheduled run again");
                    Some(run)
                }
            };
            match forward {
                Some(run) => permit.send(run),
                None => self.in_flight.release(&run_id),
            }
        }
        Ok(report)
    }

    async fn job_enabled(&self, job_id: &str, seen: &mut HashMap<String, bool>) -> Result<bool> {
        if let Some(&enabled) = seen.get(job_id) {
            return Ok(enabled);
        }
        let enabled = self.store.get_job(job_id).await?.is_some_and(|job| job.enabled);
        seen.insert(job_id.to_string(), enabled);
        Ok(enabled)
    }

    /// Tick every `tick_interval_secs` until `shutdown` broadcasts `true`.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        fired_tx: Option<mpsc::Sender<RunRecord>>,
    ) {
        info!(interval_secs = self.tick_interval.as_secs(), "scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(fired_tx.as_ref()).await {
                        Ok(report) if !report.is_clean() => {
                            warn!(failures = report.failures.len(), "tick finished with failures");
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
