//! Start a job execution and poll it to a terminal status.
use serde::{Deserialize, Serialize};

use super::activities::{GET_JOB_EXECUTION_STATUS, START_JOB_EXECUTION, StartJobRequest};
use super::{JobExecution, JobStatus};
use crate::{OrchestrationContext, ReplaySafeLogger};

pub const JOB_EXECUTION_ORCHESTRATION: &str = "ContainerAppsJobExecution";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// How often to poll, and how many polls to allow before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub interval_ms: u64,
    /// `None` polls until the execution is terminal.
    pub max_polls: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_polls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecutionRequest {
    #[serde(flatten)]
    pub start: StartJobRequest,
    #[serde(default)]
    pub poll: PollPolicy,
}

/// Start the job once, then query its status until it is terminal, sleeping
/// on a durable timer between queries.
///
/// Returns `PollingAbandoned` when `max_polls` status queries all reported a
/// running execution.
pub async fn run_job_execution(ctx: &OrchestrationContext, request: &JobExecutionRequest) -> Result<JobStatus, String> {
    let log = ReplaySafeLogger::new(ctx, "job-execution");
    let target = &request.start.target;
    log.info(format!("Starting execution for Container Apps job: {}", target.job_name));

    let execution_name: String = ctx
        .schedule_activity_typed(START_JOB_EXECUTION, &request.start)?
        .into_activity_typed()
        .await?;
    let execution = JobExecution {
        target: target.clone(),
        execution_name,
    };

    let mut polls: u32 = 0;
    loop {
        let status: JobStatus = ctx
            .schedule_activity_typed(GET_JOB_EXECUTION_STATUS, &execution)?
            .into_activity_typed()
            .await?;
        polls += 1;
        if status.is_terminal() {
            log.info(format!(
                "Container Apps job execution {} finished with status: {status}",
                execution.execution_name
            ));
            return Ok(status);
        }
        if request.poll.max_polls.is_some_and(|max| polls >= max) {
            log.warn(format!(
                "Container Apps job execution {} still {status} after {polls} polls; giving up",
                execution.execution_name
            ));
            return Ok(JobStatus::PollingAbandoned);
        }
        log.info(format!(
            "Container Apps job execution {} is still {status}, waiting...",
            execution.execution_name
        ));
        ctx.schedule_timer(request.poll.interval_ms).into_timer().await;
    }
}

/// Orchestration body registered as `ContainerAppsJobExecution`.
pub async fn job_execution_orchestration(
    ctx: OrchestrationContext,
    request: JobExecutionRequest,
) -> Result<JobStatus, String> {
    run_job_execution(&ctx, &request).await
}
