//! Registers the transcription orchestrations and activities with the runtime.
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::jobs::activities::{get_job_execution_status, start_job_execution};
use crate::jobs::arm::ArmJobsClient;
use crate::jobs::credential::{ManagedIdentityCredential, StaticToken, TokenSource};
use crate::jobs::orchestration::job_execution_orchestration;
use crate::jobs::{
    ContainerJobs, GET_JOB_EXECUTION_STATUS, JOB_EXECUTION_ORCHESTRATION, JobExecution, JobExecutionRequest, JobStatus,
    START_JOB_EXECUTION, StartJobRequest,
};
use crate::runtime::{ActivityRegistry, OrchestrationRegistry};
use crate::sessions::{HttpSessionCatalog, RESOLVE_VIDEO_SESSIONS, SessionCatalog, resolve_video_sessions};
use crate::transcripts::{FAN_OUT_ORCHESTRATION, TranscriptResult, TranscriptionSettings, transcribe_sessions};

/// External services the activities call, built once per process.
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn ContainerJobs>,
    pub catalog: Arc<dyn SessionCatalog>,
}

impl Services {
    pub fn from_config(config: &WorkerConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(config.http_timeout()).build()?;
        // Local mode always carries a token; validation enforces it
        let credential: Arc<dyn TokenSource> = match &config.access_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(ManagedIdentityCredential::from_env(http.clone())),
        };
        Ok(Self {
            jobs: Arc::new(ArmJobsClient::new(http.clone(), &config.management_endpoint, credential)),
            catalog: Arc::new(HttpSessionCatalog::new(http, &config.session_api_url, &config.session_locale)),
        })
    }
}

pub fn activity_registry(services: &Services) -> ActivityRegistry {
    let jobs = services.jobs.clone();
    let start_jobs = jobs.clone();
    let catalog = services.catalog.clone();
    ActivityRegistry::builder()
        .register_typed(START_JOB_EXECUTION, move |request: StartJobRequest| {
            let jobs = start_jobs.clone();
            async move {
                start_job_execution(jobs.as_ref(), &request)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .register_typed(GET_JOB_EXECUTION_STATUS, move |execution: JobExecution| {
            let jobs = jobs.clone();
            async move {
                get_job_execution_status(jobs.as_ref(), &execution)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .register_typed(RESOLVE_VIDEO_SESSIONS, move |selectors: Vec<String>| {
            let catalog = catalog.clone();
            async move {
                resolve_video_sessions(catalog.as_ref(), &selectors)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .build()
}

pub fn orchestration_registry(settings: TranscriptionSettings) -> Result<OrchestrationRegistry, String> {
    let settings = Arc::new(settings);
    OrchestrationRegistry::builder()
        .register_typed::<JobExecutionRequest, JobStatus, _, _>(JOB_EXECUTION_ORCHESTRATION, job_execution_orchestration)
        .register_typed::<Vec<String>, Vec<TranscriptResult>, _, _>(FAN_OUT_ORCHESTRATION, move |ctx, selectors| {
            transcribe_sessions(ctx, settings.clone(), selectors)
        })
        .build_result()
}
