//! Hands scheduled runs to an [`Executor`] and reports how they ended.
//!
//! The dispatcher is the executor-side collaborator of the lifecycle: it
//! asks admission, moves the run through STARTING and RUNNING, awaits the
//! executor and records the completion. Policy denials are resolved here:
//! `queue` parks the run until the job's next completion, `skip` and
//! unrecognised policies fail the run with a distinguishing error code.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    admission::AdmissionController,
    error::Result,
    lifecycle::{Completion, RunLifecycle},
    lock::{InFlight, JobLocks},
    store::SchedulerStore,
    types::{ConcurrencyPolicy, JobDefinition, ResourceUsage, RunRecord, RunState, TransitionOutcome},
};

pub const SKIPPED_CODE: &str = "concurrency_skipped";
pub const DENIED_CODE: &str = "admission_denied";

/// What an executor reports back once a run is over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl ExecutionReport {
    pub fn success(usage: ResourceUsage) -> Self {
        Self {
            success: true,
            usage,
            ..Self::default()
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            usage: ResourceUsage::default(),
        }
    }
}

impl From<ExecutionReport> for Completion {
    fn from(report: ExecutionReport) -> Self {
        Completion {
            success: report.success,
            error_code: report.error_code,
            error_message: report.error_message,
            usage: Some(report.usage),
        }
    }
}

/// Does the actual work of a run. Implemented by the embedding application.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &JobDefinition, run: &RunRecord) -> ExecutionReport;
}

/// How [`Dispatcher::handle`] disposed of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Executed; carries the run as completed (or as left by a concurrent cancel).
    Completed(RunRecord),
    /// Parked behind an active run of the same job.
    Queued,
    /// Refused by admission and failed with [`SKIPPED_CODE`] or [`DENIED_CODE`].
    Rejected(RunRecord),
    /// Job missing or disabled, or the run was no longer SCHEDULED. Left as is
    /// and released, so a later tick can forward it again.
    Deferred,
}

/// Where a blocked run re-enters its job's queue.
#[derive(Debug, Clone, Copy)]
enum Park {
    Back,
    /// A drained run that was blocked again keeps its place.
    Front,
}

pub struct Dispatcher {
    store: Arc<dyn SchedulerStore>,
    lifecycle: Arc<RunLifecycle>,
    admission: Arc<AdmissionController>,
    locks: Arc<JobLocks>,
    in_flight: Arc<InFlight>,
    executor: Arc<dyn Executor>,
    /// Serialises admit-then-start and queue access per job inside this dispatcher.
    gates: JobLocks,
    queued: DashMap<String, VecDeque<RunRecord>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        lifecycle: Arc<RunLifecycle>,
        admission: Arc<AdmissionController>,
        locks: Arc<JobLocks>,
        in_flight: Arc<InFlight>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            admission,
            locks,
            in_flight,
            executor,
            gates: JobLocks::new(),
            queued: DashMap::new(),
        }
    }

    /// Number of runs parked behind active runs of `job_id`.
    pub fn queued_len(&self, job_id: &str) -> usize {
        self.queued.get(job_id).map_or(0, |q| q.len())
    }

    /// Dispatch one SCHEDULED run, then drain anything queued behind its job.
    pub async fn handle(&self, run: RunRecord) -> Result<DispatchOutcome> {
        let job_id = run.job_id.clone();
        let outcome = self.attempt(run, Park::Back).await?;
        if matches!(outcome, DispatchOutcome::Completed(_)) {
            self.drain(&job_id).await?;
        }
        Ok(outcome)
    }

    /// Receive runs until every sender is gone; each run gets its own task.
    ///
    /// Returns only after every run already received has finished.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RunRecord>) {
        info!("dispatcher started");
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(run) = received else { break };
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let run_id = run.id.clone();
                        if let Err(e) = this.handle(run).await {
                            error!(%run_id, "dispatch failed: {e}");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("dispatch task aborted: {e}");
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(runs = tasks.len(), "waiting for in-flight runs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("dispatch task aborted: {e}");
            }
        }
        info!("dispatcher stopped");
    }

    /// Retry queued runs of `job_id` in arrival order until one is blocked again.
    async fn drain(&self, job_id: &str) -> Result<()> {
        loop {
            // Taken under the gate: a run being parked right now is either
            // already in the queue or will see this completion in admission.
            let next = {
                let _gate = self.gates.acquire(job_id).await;
                self.queued.get_mut(job_id).and_then(|mut q| q.pop_front())
            };
            let Some(run) = next else {
                return Ok(());
            };
            debug!(run_id = %run.id, job_id, "retrying queued run");
            if self.attempt(run, Park::Front).await? == DispatchOutcome::Queued {
                return Ok(());
            }
        }
    }

    /// [`dispatch_one`](Self::dispatch_one), releasing the run's claim unless it was parked.
    async fn attempt(&self, run: RunRecord, park: Park) -> Result<DispatchOutcome> {
        let run_id = run.id.clone();
        let result = self.dispatch_one(run, park).await;
        if !matches!(result, Ok(DispatchOutcome::Queued)) {
            self.in_flight.release(&run_id);
        }
        result
    }

    async fn dispatch_one(&self, run: RunRecord, park: Park) -> Result<DispatchOutcome> {
        let job = match self.store.get_job(&run.job_id).await? {
            Some(job) if job.enabled => job,
            Some(_) => {
                debug!(run_id = %run.id, job_id = %run.job_id, "job disabled; run left pending");
                return Ok(DispatchOutcome::Deferred);
            }
            None => {
                warn!(run_id = %run.id, job_id = %run.job_id, "job not found; run left pending");
                return Ok(DispatchOutcome::Deferred);
            }
        };

        let gate = self.gates.acquire(&job.id).await;
        let admission = self.admission.can_run_job(&job).await?;
        if !admission.can_run && job.concurrency == ConcurrencyPolicy::Queue {
            debug!(run_id = %run.id, job_id = %job.id, "run queued");
            let mut queue = self.queued.entry(job.id.clone()).or_default();
            match park {
                Park::Back => queue.push_back(run),
                Park::Front => queue.push_front(run),
            }
            return Ok(DispatchOutcome::Queued);
        }

        let started = match self.lifecycle.mark_run_started(&run.id).await? {
            TransitionOutcome::Applied(started) => started,
            other => {
                debug!(run_id = %run.id, ?other, "run not startable");
                return Ok(DispatchOutcome::Deferred);
            }
        };

        if !admission.can_run {
            drop(gate);
            let code = match job.concurrency {
                ConcurrencyPolicy::Skip => SKIPPED_CODE,
                _ => DENIED_CODE,
            };
            let reason = admission.reason.unwrap_or_else(|| "admission denied".to_string());
            info!(run_id = %started.id, job_id = %job.id, code, "run rejected");
            let outcome = self
                .lifecycle
                .mark_run_completed(&started.id, Completion::failure(code, reason))
                .await?;
            let run = outcome.run().cloned().unwrap_or(started);
            return Ok(DispatchOutcome::Rejected(run));
        }

        let running = self.mark_running(started).await?;
        drop(gate);
        if running.state != RunState::Running {
            // Cancelled between start and hand-off.
            return Ok(DispatchOutcome::Completed(running));
        }

        let report = self.executor.execute(&job, &running).await;
        let outcome = self
            .lifecycle
            .mark_run_completed(&running.id, report.into())
            .await?;
        let run = outcome.run().cloned().unwrap_or(running);
        Ok(DispatchOutcome::Completed(run))
    }

    /// STARTING -> RUNNING, written on the executor's behalf.
    async fn mark_running(&self, run: RunRecord) -> Result<RunRecord> {
        let _guard = self.locks.acquire(&run.job_id).await;
        let Some(mut current) = self.store.get_run(&run.id).await? else {
            return Ok(run);
        };
        if current.state.can_transition_to(RunState::Running) {
            current.state = RunState::Running;
            self.store.save_run(&current).await?;
            debug!(run_id = %current.id, "run running");
        }
        Ok(current)
    }
}
