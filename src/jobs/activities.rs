//! Single-shot job operations run as activities. Their results are recorded
//! in history once, so replay never repeats a start.
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ContainerJobs, EnvOverrides, JobExecution, JobStatus, JobTarget, JobsError};

pub const START_JOB_EXECUTION: &str = "StartContainerAppsJobExecution";
pub const GET_JOB_EXECUTION_STATUS: &str = "GetContainerAppsJobExecutionStatus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobRequest {
    #[serde(flatten)]
    pub target: JobTarget,
    #[serde(default, skip_serializing_if = "EnvOverrides::is_empty")]
    pub env: EnvOverrides,
}

/// Start an execution of the target job and return its execution name.
///
/// With overrides the current template is fetched, the overrides are merged
/// into its first container and the execution is started with that template.
/// Without overrides the job starts with its stored template and nothing is
/// fetched.
pub async fn start_job_execution(jobs: &dyn ContainerJobs, request: &StartJobRequest) -> Result<String, JobsError> {
    let target = &request.target;
    let template = if request.env.is_empty() {
        None
    } else {
        info!(job = %target, overrides = request.env.len(), "overriding job environment");
        let mut template = jobs
            .get_job_template(target)
            .await?
            .ok_or_else(|| JobsError::MissingTemplate(target.to_string()))?;
        template.apply_overrides(&request.env)?;
        Some(template)
    };

    let execution_name = jobs
        .start_job(target, template.as_ref())
        .await?
        .filter(|name| !name.is_empty())
        .ok_or_else(|| JobsError::MissingExecutionName(target.to_string()))?;
    info!(job = %target, execution = %execution_name, "job execution started");
    Ok(execution_name)
}

pub async fn get_job_execution_status(jobs: &dyn ContainerJobs, execution: &JobExecution) -> Result<JobStatus, JobsError> {
    let reported = jobs.get_execution_status(execution).await?;
    let status = JobStatus::from_reported(reported.as_deref());
    debug!(job = %execution.target, execution = %execution.execution_name, %status, "job execution status");
    Ok(status)
}
