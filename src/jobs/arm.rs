//! Container Apps jobs over the Azure Resource Manager REST API.
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::credential::TokenSource;
use super::{ContainerJobs, JobExecution, JobTarget, JobTemplate, JobsError};

pub const API_VERSION: &str = "2024-03-01";
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

#[derive(Deserialize)]
struct JobResource {
    #[serde(default)]
    properties: Option<JobProperties>,
}

#[derive(Deserialize)]
struct JobProperties {
    #[serde(default)]
    template: Option<JobTemplate>,
}

#[derive(Deserialize)]
struct StartedExecution {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ExecutionResource {
    #[serde(default)]
    properties: Option<ExecutionProperties>,
}

#[derive(Deserialize)]
struct ExecutionProperties {
    #[serde(default)]
    status: Option<String>,
}

pub struct ArmJobsClient {
    http: reqwest::Client,
    base_url: String,
    credential: Arc<dyn TokenSource>,
}

impl ArmJobsClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, credential: Arc<dyn TokenSource>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn job_url(&self, target: &JobTarget) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/jobs/{}",
            self.base_url, target.subscription_id, target.resource_group, target.job_name
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, JobsError> {
        let token = self.credential.token().await?;
        let response = request
            .bearer_auth(token)
            .query(&[("api-version", API_VERSION)])
            .send()
            .await?;
        Ok(response)
    }

    async fn error_for(response: Response) -> JobsError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        JobsError::Http { status, body }
    }
}

#[async_trait]
impl ContainerJobs for ArmJobsClient {
    async fn get_job_template(&self, target: &JobTarget) -> Result<Option<JobTemplate>, JobsError> {
        let response = self.send(self.http.get(self.job_url(target))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(job = %target, "job not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let job: JobResource = response.json().await.map_err(|e| JobsError::Decode(e.to_string()))?;
        Ok(job.properties.and_then(|p| p.template))
    }

    async fn start_job(
        &self,
        target: &JobTarget,
        template: Option<&JobTemplate>,
    ) -> Result<Option<String>, JobsError> {
        let mut request = self.http.post(format!("{}/start", self.job_url(target)));
        if let Some(t) = template {
            request = request.json(t);
        }
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let started: StartedExecution =
            serde_json::from_slice(&body).map_err(|e| JobsError::Decode(e.to_string()))?;
        Ok(started.name)
    }

    async fn get_execution_status(&self, execution: &JobExecution) -> Result<Option<String>, JobsError> {
        let url = format!(
            "{}/executions/{}",
            self.job_url(&execution.target),
            execution.execution_name
        );
        let response = self.send(self.http.get(url)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let resource: ExecutionResource = response.json().await.map_err(|e| JobsError::Decode(e.to_string()))?;
        Ok(resource.properties.and_then(|p| p.status))
    }
}
