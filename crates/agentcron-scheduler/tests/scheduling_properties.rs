// End-to-end behaviour over the SQLite store, driven through the public API.

use std::sync::Arc;

use agentcron_core::config::SchedulerConfig;
use agentcron_scheduler::{
    Clock, DispatchOutcome, Dispatcher, ExecutionReport, Executor, JobDefinition, ManualClock, NoJitter,
    ResourceUsage, RunRecord, RunState, Scheduler, SchedulerStore, SqliteStore, TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 6, 0, 0).unwrap()
}

fn setup(start: DateTime<Utc>) -> (Arc<SqliteStore>, Arc<ManualClock>, Scheduler) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(start));
    let scheduler = Scheduler::new(
        store.clone(),
        &SchedulerConfig::default(),
        clock.clone(),
        Arc::new(NoJitter),
    )
    .unwrap();
    (store, clock, scheduler)
}

struct Echo;

#[async_trait]
impl Executor for Echo {
    async fn execute(&self, job: &JobDefinition, _run: &RunRecord) -> ExecutionReport {
        match job.action.get("fail").and_then(|v| v.as_bool()) {
            Some(true) => ExecutionReport::failure("agent_error", "model refused"),
            _ => ExecutionReport::success(ResourceUsage {
                steps: 1,
                tokens: 42,
                duration_ms: 3,
                bandwidth_bytes: 512,
            }),
        }
    }
}

#[tokio::test]
async fn catch_up_survives_a_restart() {
    let (store, clock, scheduler) = setup(t0() - Duration::minutes(1));
    let job = JobDefinition::new("nightly", "*/15 * * * *").with_catchup(true);
    scheduler.upsert_job(&job).await.unwrap();

    let mut state = store.get_schedule("nightly").await.unwrap().unwrap();
    assert_eq!(state.next_due, Some(t0()));
    state.last_success = Some(t0());
    store.save_schedule(&state).await.unwrap();
    drop(scheduler);

    // A new scheduler over the same store, an hour and a bit later.
    clock.set(t0() + Duration::minutes(67));
    let scheduler = Scheduler::new(
        store.clone(),
        &SchedulerConfig::default(),
        clock.clone(),
        Arc::new(NoJitter),
    )
    .unwrap();
    let report = scheduler.engine().update_all_schedules().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.scheduled[0].runs_created, 4);
    assert_eq!(report.scheduled[0].next_due, Some(t0() + Duration::minutes(75)));

    let slots: Vec<_> = store
        .list_runs(Some("nightly"))
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.scheduled_at - t0()).num_minutes())
        .collect();
    assert_eq!(slots, [15, 30, 45, 60]);
}

#[tokio::test]
async fn run_now_leaves_catch_up_intact() {
    let (store, clock, scheduler) = setup(t0());
    let job = JobDefinition::new("hourly", "0 * * * *").with_catchup(true);
    scheduler.upsert_job(&job).await.unwrap();
    let mut state = store.get_schedule("hourly").await.unwrap().unwrap();
    state.last_success = Some(t0());
    store.save_schedule(&state).await.unwrap();

    clock.set(t0() + Duration::minutes(210));
    let manual = scheduler.run_now("hourly").await.unwrap();
    let outcome = scheduler.engine().schedule_job(&job).await.unwrap();
    assert_eq!(outcome.runs_created, 3);

    let runs = store.list_runs(Some("hourly")).await.unwrap();
    assert_eq!(runs.len(), 4);
    let slots: Vec<_> = runs
        .iter()
        .filter(|r| r.id != manual.id)
        .map(|r| (r.scheduled_at - t0()).num_minutes())
        .collect();
    assert_eq!(slots, [60, 120, 180]);
}

#[tokio::test]
async fn scheduled_runs_are_forwarded_after_a_restart() {
    let (store, _clock, scheduler) = setup(t0());
    scheduler
        .upsert_job(&JobDefinition::new("report", "0 0 1 1 *"))
        .await
        .unwrap();
    let run = scheduler.run_now("report").await.unwrap();

    // Forwarded, then the process dies before the dispatcher sees it.
    let (tx, mut rx) = mpsc::channel(4);
    scheduler.tick(Some(&tx)).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().id, run.id);
    drop((tx, rx, scheduler));

    let scheduler = Scheduler::new(
        store.clone(),
        &SchedulerConfig::default(),
        Arc::new(ManualClock::new(t0())),
        Arc::new(NoJitter),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    scheduler.tick(Some(&tx)).await.unwrap();
    let again = rx.try_recv().unwrap();
    assert_eq!(again.id, run.id);
    assert_eq!(again.state, RunState::Scheduled);
}

#[tokio::test]
async fn skip_missed_reschedules_without_runs() {
    let (store, clock, scheduler) = setup(t0());
    let job = JobDefinition::new("digest", "0 */6 * * *");
    scheduler.upsert_job(&job).await.unwrap();

    clock.advance(Duration::days(2));
    let outcome = scheduler.engine().schedule_job(&job).await.unwrap();
    assert_eq!(outcome.runs_created, 0);
    assert!(outcome.next_due.unwrap() > clock.now());
    assert!(store.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn tick_to_completion() {
    let (store, clock, scheduler) = setup(t0() - Duration::seconds(10));
    let lifecycle = scheduler.lifecycle().clone();
    let dispatcher = Dispatcher::new(
        store.clone(),
        lifecycle,
        scheduler.admission().clone(),
        scheduler.locks().clone(),
        scheduler.in_flight().clone(),
        Arc::new(Echo),
    );
    scheduler
        .upsert_job(&JobDefinition::new("ok", "0 * * * *"))
        .await
        .unwrap();
    scheduler
        .upsert_job(
            &JobDefinition::new("bad", "0 * * * *")
                .with_action(serde_json::json!({ "fail": true })),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    clock.set(t0() + Duration::seconds(2));
    scheduler.tick(Some(&tx)).await.unwrap();

    let mut handled = 0;
    while let Ok(run) = rx.try_recv() {
        assert_eq!(run.state, RunState::Scheduled);
        let outcome = dispatcher.handle(run).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        handled += 1;
    }
    assert_eq!(handled, 2);

    let runs = store.list_runs(None).await.unwrap();
    let ok = runs.iter().find(|r| r.job_id == "ok").unwrap();
    assert_eq!(ok.state, RunState::Succeeded);
    assert_eq!(ok.resource_usage.bandwidth_bytes, 512);
    let bad = runs.iter().find(|r| r.job_id == "bad").unwrap();
    assert_eq!(bad.state, RunState::Failed);
    assert_eq!(bad.error_code.as_deref(), Some("agent_error"));

    let ok_state = store.get_schedule("ok").await.unwrap().unwrap();
    assert_eq!(ok_state.last_success, Some(t0() + Duration::seconds(2)));
    assert_eq!(ok_state.next_due, Some(t0() + Duration::hours(1)));
    let bad_state = store.get_schedule("bad").await.unwrap().unwrap();
    assert!(bad_state.last_success.is_none());
    assert!(bad_state.last_attempt.is_some());
}

#[tokio::test]
async fn cancel_previous_supersedes_the_running_run() {
    let (store, _clock, scheduler) = setup(t0());
    let job = JobDefinition::new("crawl", "0 0 * * *").with_concurrency("cancel-previous");
    scheduler.upsert_job(&job).await.unwrap();
    let lifecycle = scheduler.lifecycle();

    let old = scheduler.run_now("crawl").await.unwrap();
    lifecycle.mark_run_scheduled(&old.id).await.unwrap();
    lifecycle.mark_run_started(&old.id).await.unwrap();

    let admission = scheduler.admission().can_run_job(&job).await.unwrap();
    assert!(admission.can_run);
    let old = store.get_run(&old.id).await.unwrap().unwrap();
    assert_eq!(old.state, RunState::Cancelled);

    // The executor reporting late does not resurrect it.
    let late = lifecycle
        .mark_run_completed(&old.id, agentcron_scheduler::Completion::success())
        .await
        .unwrap();
    assert!(matches!(late, TransitionOutcome::Unchanged(_)));
}

#[test]
fn transition_outcome_wire_shape() {
    let json = serde_json::to_value(TransitionOutcome::NotFound).unwrap();
    assert_eq!(json, serde_json::json!({ "outcome": "not_found" }));

    let run = RunRecord::due("j", t0(), t0());
    let json = serde_json::to_value(TransitionOutcome::Applied(run.clone())).unwrap();
    assert_eq!(json["outcome"], "applied");
    assert_eq!(json["run"]["id"], run.id.as_str());
    assert_eq!(json["run"]["state"], "due");
}
