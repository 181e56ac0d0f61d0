use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::Result,
    lifecycle::RunLifecycle,
    lock::JobLocks,
    types::{Admission, ConcurrencyPolicy, JobDefinition},
};

/// Decides whether a new run of a job may start, given the job's active
/// runs and its [`ConcurrencyPolicy`].
///
/// Never queues anything itself. `cancel-previous` is the only policy with a
/// side effect: it cancels the active runs before admitting.
pub struct AdmissionController {
    lifecycle: Arc<RunLifecycle>,
    locks: Arc<JobLocks>,
}

impl AdmissionController {
    pub fn new(lifecycle: Arc<RunLifecycle>, locks: Arc<JobLocks>) -> Self {
        Self { lifecycle, locks }
    }

    pub async fn can_run_job(&self, job: &JobDefinition) -> Result<Admission> {
        let _guard = self.locks.acquire(&job.id).await;
        let active = self.lifecycle.active_runs(&job.id).await?;

        let Some(first) = active.first() else {
            return Ok(Admission::admit());
        };
        let existing = first.id.clone();

        let admission = match &job.concurrency {
            ConcurrencyPolicy::Allow => Admission::admit(),
            ConcurrencyPolicy::Skip => Admission::deny(
                format!("job already active in run {existing}; skipping"),
                Some(existing),
            ),
            ConcurrencyPolicy::Queue => Admission::deny(
                format!("job already active in run {existing}; queue behind it"),
                Some(existing),
            ),
            ConcurrencyPolicy::CancelPrevious => {
                let count = active.len();
                for run in active {
                    // Lock is already held; go through the unlocked path.
                    self.lifecycle.cancel_locked(run).await?;
                }
                info!(job_id = %job.id, cancelled = count, "cancelled previous runs");
                Admission::admit()
            }
            ConcurrencyPolicy::Other(raw) => {
                warn!(job_id = %job.id, policy = %raw, "unknown concurrency policy; denying");
                Admission::deny(format!("unknown concurrency policy: {raw}"), Some(existing))
            }
        };

        debug!(
            job_id = %job.id,
            policy = %job.concurrency,
            can_run = admission.can_run,
            "admission decided"
        );
        Ok(admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::store::SchedulerStore;
    use crate::types::{RunRecord, RunState};
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        admission: AdmissionController,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(JobLocks::new());
        let lifecycle = Arc::new(RunLifecycle::new(
            store.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            locks.clone(),
        ));
        Fixture {
            store,
            admission: AdmissionController::new(lifecycle, locks),
        }
    }

    async fn run_in(fx: &Fixture, job_id: &str, state: RunState) -> RunRecord {
        let now = Utc::now();
        let mut run = RunRecord::due(job_id, now, now);
        run.state = state;
        if state.is_active() {
            run.started_at = Some(now);
        }
        fx.store.save_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn idle_job_is_admitted_under_every_policy() {
        let fx = fixture();
        run_in(&fx, "j", RunState::Succeeded).await;
        run_in(&fx, "j", RunState::Scheduled).await;
        for policy in ["allow", "skip", "queue", "cancel-previous", "bogus"] {
            let job = JobDefinition::new("j", "* * * * *").with_concurrency(policy);
            assert!(fx.admission.can_run_job(&job).await.unwrap().can_run, "{policy}");
        }
    }

    #[tokio::test]
    async fn allow_admits_alongside_running() {
        let fx = fixture();
        run_in(&fx, "j", RunState::Running).await;
        let job = JobDefinition::new("j", "* * * * *").with_concurrency("allow");
        assert!(fx.admission.can_run_job(&job).await.unwrap().can_run);
        assert!(fx.admission.can_run_job(&job).await.unwrap().can_run);
    }

    #[tokio::test]
    async fn skip_reports_the_active_run() {
        let fx = fixture();
        let active = run_in(&fx, "j", RunState::Running).await;
        let job = JobDefinition::new("j", "* * * * *").with_concurrency("skip");
        let admission = fx.admission.can_run_job(&job).await.unwrap();
        assert!(!admission.can_run);
        assert_eq!(admission.existing_run_id, Some(active.id));
    }

    #[tokio::test]
    async fn queue_denies_without_side_effects() {
        let fx = fixture();
        let active = run_in(&fx, "j", RunState::Starting).await;
        let job = JobDefinition::new("j", "* * * * *").with_concurrency("queue");
        let admission = fx.admission.can_run_job(&job).await.unwrap();
        assert!(!admission.can_run);
        assert_eq!(admission.existing_run_id.as_deref(), Some(active.id.as_str()));
        let stored = fx.store.get_run(&active.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Starting);
    }

    #[tokio::test]
    async fn cancel_previous_cancels_every_active_run() {
        let fx = fixture();
        let a = run_in(&fx, "j", RunState::Running).await;
        let b = run_in(&fx, "j", RunState::Starting).await;
        let other = run_in(&fx, "k", RunState::Running).await;
        let job = JobDefinition::new("j", "* * * * *").with_concurrency("cancel-previous");

        let admission = fx.admission.can_run_job(&job).await.unwrap();
        assert!(admission.can_run);
        for id in [&a.id, &b.id] {
            let run = fx.store.get_run(id).await.unwrap().unwrap();
            assert_eq!(run.state, RunState::Cancelled);
            assert!(run.completed_at.is_some());
        }
        let untouched = fx.store.get_run(&other.id).await.unwrap().unwrap();
        assert_eq!(untouched.state, RunState::Running);
    }

    #[tokio::test]
    async fn unknown_policy_fails_closed() {
        let fx = fixture();
        run_in(&fx, "j", RunState::Running).await;
        let job = JobDefinition::new("j", "* * * * *").with_concurrency("yolo");
        let admission = fx.admission.can_run_job(&job).await.unwrap();
        assert!(!admission.can_run);
        assert!(admission.reason.unwrap().contains("unknown concurrency policy"));
    }
}
