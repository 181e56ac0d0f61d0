use std::time::Instant;

use agentcron_scheduler::{ExecutionReport, Executor, JobDefinition, ResourceUsage, RunRecord};
use async_trait::async_trait;
use tracing::info;

/// Stand-in executor for the standalone daemon: logs the job's action
/// payload and reports success.
///
/// Embedding applications provide their own [`Executor`] that runs the agent.
pub struct LogExecutor;

#[async_trait]
impl Executor for LogExecutor {
    async fn execute(&self, job: &JobDefinition, run: &RunRecord) -> ExecutionReport {
        let started = Instant::now();
        let payload = serde_json::to_string(&job.action).unwrap_or_default();
        info!(
            job_id = %job.id,
            run_id = %run.id,
            name = %job.name,
            scheduled_at = %run.scheduled_at,
            action = %payload,
            "executing run"
        );
        ExecutionReport::success(ResourceUsage {
            steps: 1,
            duration_ms: started.elapsed().as_millis() as u64,
            bandwidth_bytes: payload.len() as u64,
            ..ResourceUsage::default()
        })
    }
}
