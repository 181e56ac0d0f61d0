use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    error::Result,
    lock::{JobGuard, JobLocks},
    store::SchedulerStore,
    types::{ResourceUsage, RunRecord, RunState, ScheduleState, TransitionOutcome},
};

/// How a run ended, as reported by whoever executed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub usage: Option<ResourceUsage>,
}

impl Completion {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Sole writer of run state after creation.
///
/// Every transition loads the run, takes its job's lock, re-reads the run
/// and only then applies the edge, so concurrent callers cannot interleave.
/// Unknown run ids yield [`TransitionOutcome::NotFound`]; edges the state
/// machine does not allow yield [`TransitionOutcome::Unchanged`].
pub struct RunLifecycle {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<JobLocks>,
}

impl RunLifecycle {
    pub fn new(store: Arc<dyn SchedulerStore>, clock: Arc<dyn Clock>, locks: Arc<JobLocks>) -> Self {
        Self { store, clock, locks }
    }

    /// DUE -> SCHEDULED. Stamps the job's `last_scheduled`.
    pub async fn mark_run_scheduled(&self, run_id: &str) -> Result<TransitionOutcome> {
        let Some((_guard, mut run)) = self.lock_run(run_id).await? else {
            debug!(run_id, "mark_run_scheduled: no such run");
            return Ok(TransitionOutcome::NotFound);
        };
        if !run.state.can_transition_to(RunState::Scheduled) {
            return Ok(refuse(run, RunState::Scheduled));
        }

        let now = self.clock.now();
        run.state = RunState::Scheduled;
        self.store.save_run(&run).await?;
        self.touch_schedule(&run.job_id, |s| s.last_scheduled = Some(now))
            .await?;
        debug!(run_id, job_id = %run.job_id, "run scheduled");
        Ok(TransitionOutcome::Applied(run))
    }

    /// SCHEDULED -> STARTING. Stamps `started_at`.
    pub async fn mark_run_started(&self, run_id: &str) -> Result<TransitionOutcome> {
        let Some((_guard, mut run)) = self.lock_run(run_id).await? else {
            debug!(run_id, "mark_run_started: no such run");
            return Ok(TransitionOutcome::NotFound);
        };
        if !run.state.can_transition_to(RunState::Starting) {
            return Ok(refuse(run, RunState::Starting));
        }

        run.state = RunState::Starting;
        run.started_at = Some(self.clock.now());
        self.store.save_run(&run).await?;
        info!(run_id, job_id = %run.job_id, "run starting");
        Ok(TransitionOutcome::Applied(run))
    }

    /// STARTING/RUNNING -> SUCCEEDED or FAILED.
    ///
    /// Error fields are stored only on failure. The job's `last_attempt` is
    /// always stamped, `last_success` only on success.
    pub async fn mark_run_completed(
        &self,
        run_id: &str,
        completion: Completion,
    ) -> Result<TransitionOutcome> {
        let target = if completion.success {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        let Some((_guard, mut run)) = self.lock_run(run_id).await? else {
            debug!(run_id, "mark_run_completed: no such run");
            return Ok(TransitionOutcome::NotFound);
        };
        if !run.state.can_transition_to(target) {
            return Ok(refuse(run, target));
        }

        let now = self.clock.now();
        run.state = target;
        run.completed_at = Some(now);
        if !completion.success {
            run.error_code = completion.error_code;
            run.error_message = completion.error_message;
        }
        if let Some(usage) = completion.usage {
            run.resource_usage = usage;
        }
        self.store.save_run(&run).await?;

        let success = completion.success;
        self.touch_schedule(&run.job_id, |s| {
            s.last_attempt = Some(now);
            if success {
                s.last_success = Some(now);
            }
        })
        .await?;

        if success {
            info!(run_id, job_id = %run.job_id, "run succeeded");
        } else {
            warn!(
                run_id,
                job_id = %run.job_id,
                code = run.error_code.as_deref().unwrap_or("-"),
                "run failed"
            );
        }
        Ok(TransitionOutcome::Applied(run))
    }

    /// STARTING/RUNNING -> CANCELLED. Terminal and pending runs are left alone.
    pub async fn cancel_run(&self, run_id: &str) -> Result<TransitionOutcome> {
        let Some((_guard, run)) = self.lock_run(run_id).await? else {
            debug!(run_id, "cancel_run: no such run");
            return Ok(TransitionOutcome::NotFound);
        };
        self.cancel_locked(run).await
    }

    /// Cancel `run` while the caller already holds its job's lock.
    pub(crate) async fn cancel_locked(&self, mut run: RunRecord) -> Result<TransitionOutcome> {
        if !run.state.can_transition_to(RunState::Cancelled) {
            return Ok(refuse(run, RunState::Cancelled));
        }
        run.state = RunState::Cancelled;
        run.completed_at = Some(self.clock.now());
        self.store.save_run(&run).await?;
        info!(run_id = %run.id, job_id = %run.job_id, "run cancelled");
        Ok(TransitionOutcome::Applied(run))
    }

    /// Runs that exist but have not been handed to an executor yet.
    pub async fn get_pending_runs(&self) -> Result<Vec<RunRecord>> {
        let runs = self.store.list_runs(None).await?;
        Ok(runs.into_iter().filter(|r| r.state.is_pending()).collect())
    }

    /// Runs of `job_id` in STARTING or RUNNING.
    pub async fn active_runs(&self, job_id: &str) -> Result<Vec<RunRecord>> {
        let runs = self.store.list_runs(Some(job_id)).await?;
        Ok(runs.into_iter().filter(|r| r.state.is_active()).collect())
    }

    /// Load `run_id`, take its job's lock, and re-read the run under it.
    async fn lock_run(&self, run_id: &str) -> Result<Option<(JobGuard, RunRecord)>> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        let guard = self.locks.acquire(&run.job_id).await;
        let run = self.store.get_run(run_id).await?;
        Ok(run.map(|r| (guard, r)))
    }

    /// Apply `update` to the job's schedule row, if there is one.
    async fn touch_schedule<F>(&self, job_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut ScheduleState) + Send,
    {
        match self.store.get_schedule(job_id).await? {
            Some(mut schedule) => {
                update(&mut schedule);
                self.store.save_schedule(&schedule).await
            }
            None => {
                debug!(job_id, "no schedule row to update");
                Ok(())
            }
        }
    }
}

fn refuse(run: RunRecord, target: RunState) -> TransitionOutcome {
    if run.state == target {
        debug!(run_id = %run.id, state = %run.state, "transition already applied");
    } else {
        warn!(
            run_id = %run.id,
            from = %run.state,
            to = %target,
            "transition not allowed; run left unchanged"
        );
    }
    TransitionOutcome::Unchanged(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        lifecycle: RunLifecycle,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 9, 0, 0).unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        store
            .save_schedule(&ScheduleState::new("job", Some(t0()), t0()))
            .await
            .unwrap();
        let lifecycle = RunLifecycle::new(store.clone(), clock.clone(), Arc::new(JobLocks::new()));
        Fixture {
            store,
            clock,
            lifecycle,
        }
    }

    async fn due_run(fx: &Fixture) -> RunRecord {
        let run = RunRecord::due("job", t0(), t0());
        fx.store.save_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn happy_path_updates_schedule_bookkeeping() {
        let fx = fixture().await;
        let run = due_run(&fx).await;

        fx.clock.advance(Duration::seconds(1));
        assert!(fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap().is_applied());
        let sched = fx.store.get_schedule("job").await.unwrap().unwrap();
        assert_eq!(sched.last_scheduled, Some(t0() + Duration::seconds(1)));

        fx.clock.advance(Duration::seconds(1));
        let started = fx.lifecycle.mark_run_started(&run.id).await.unwrap();
        assert_eq!(
            started.run().unwrap().started_at,
            Some(t0() + Duration::seconds(2))
        );

        fx.clock.advance(Duration::seconds(30));
        let usage = ResourceUsage {
            steps: 4,
            tokens: 900,
            duration_ms: 30_000,
            bandwidth_bytes: 2_048,
        };
        let done = fx
            .lifecycle
            .mark_run_completed(&run.id, Completion::success().with_usage(usage.clone()))
            .await
            .unwrap();
        let done = done.run().unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert_eq!(done.completed_at, Some(t0() + Duration::seconds(32)));
        assert_eq!(done.resource_usage, usage);
        assert!(done.error_code.is_none());

        let sched = fx.store.get_schedule("job").await.unwrap().unwrap();
        assert_eq!(sched.last_attempt, Some(t0() + Duration::seconds(32)));
        assert_eq!(sched.last_success, Some(t0() + Duration::seconds(32)));
    }

    #[tokio::test]
    async fn failure_records_error_but_not_success() {
        let fx = fixture().await;
        let run = due_run(&fx).await;
        fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap();
        fx.lifecycle.mark_run_started(&run.id).await.unwrap();

        let done = fx
            .lifecycle
            .mark_run_completed(&run.id, Completion::failure("llm_timeout", "provider hung"))
            .await
            .unwrap();
        let done = done.run().unwrap();
        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.error_code.as_deref(), Some("llm_timeout"));
        assert_eq!(done.error_message.as_deref(), Some("provider hung"));

        let sched = fx.store.get_schedule("job").await.unwrap().unwrap();
        assert_eq!(sched.last_attempt, Some(t0()));
        assert_eq!(sched.last_success, None);
    }

    #[tokio::test]
    async fn success_ignores_error_fields() {
        let fx = fixture().await;
        let run = due_run(&fx).await;
        fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap();
        fx.lifecycle.mark_run_started(&run.id).await.unwrap();

        let mut completion = Completion::failure("x", "y");
        completion.success = true;
        let done = fx.lifecycle.mark_run_completed(&run.id, completion).await.unwrap();
        assert!(done.run().unwrap().error_code.is_none());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let fx = fixture().await;
        assert_eq!(
            fx.lifecycle.mark_run_scheduled("ghost").await.unwrap(),
            TransitionOutcome::NotFound
        );
        assert_eq!(
            fx.lifecycle.cancel_run("ghost").await.unwrap(),
            TransitionOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn terminal_runs_never_move() {
        let fx = fixture().await;
        let run = due_run(&fx).await;
        fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap();
        fx.lifecycle.mark_run_started(&run.id).await.unwrap();
        fx.lifecycle
            .mark_run_completed(&run.id, Completion::success())
            .await
            .unwrap();

        for outcome in [
            fx.lifecycle.cancel_run(&run.id).await.unwrap(),
            fx.lifecycle.mark_run_started(&run.id).await.unwrap(),
            fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap(),
            fx.lifecycle
                .mark_run_completed(&run.id, Completion::failure("late", "too late"))
                .await
                .unwrap(),
        ] {
            assert!(matches!(outcome, TransitionOutcome::Unchanged(_)));
        }
        let stored = fx.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Succeeded);
        assert!(stored.error_code.is_none());
    }

    #[tokio::test]
    async fn cancel_only_touches_active_runs() {
        let fx = fixture().await;
        let run = due_run(&fx).await;

        // Pending runs are not cancellable.
        assert!(matches!(
            fx.lifecycle.cancel_run(&run.id).await.unwrap(),
            TransitionOutcome::Unchanged(_)
        ));

        fx.lifecycle.mark_run_scheduled(&run.id).await.unwrap();
        fx.lifecycle.mark_run_started(&run.id).await.unwrap();
        let cancelled = fx.lifecycle.cancel_run(&run.id).await.unwrap();
        let cancelled = cancelled.run().unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Repeat is a no-op.
        assert!(!fx.lifecycle.cancel_run(&run.id).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn starting_requires_scheduled() {
        let fx = fixture().await;
        let run = due_run(&fx).await;
        assert!(matches!(
            fx.lifecycle.mark_run_started(&run.id).await.unwrap(),
            TransitionOutcome::Unchanged(_)
        ));
        assert!(fx.store.get_run(&run.id).await.unwrap().unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn pending_runs_are_due_or_scheduled() {
        let fx = fixture().await;
        let a = due_run(&fx).await;
        let b = due_run(&fx).await;
        let c = due_run(&fx).await;
        fx.lifecycle.mark_run_scheduled(&b.id).await.unwrap();
        fx.lifecycle.mark_run_scheduled(&c.id).await.unwrap();
        fx.lifecycle.mark_run_started(&c.id).await.unwrap();

        let mut pending: Vec<_> = fx
            .lifecycle
            .get_pending_runs()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        pending.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(pending, expected);
    }
}
