//! Container Apps job executions: data model, the service interface and the
//! start-then-poll orchestration built on top of it.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub mod activities;
pub mod arm;
pub mod credential;
pub mod orchestration;

pub use activities::{GET_JOB_EXECUTION_STATUS, START_JOB_EXECUTION, StartJobRequest};
pub use orchestration::{JOB_EXECUTION_ORCHESTRATION, JobExecutionRequest, PollPolicy};

/// The job a request targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTarget {
    pub subscription_id: String,
    pub resource_group: String,
    pub job_name: String,
}

impl JobTarget {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            job_name: job_name.into(),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.job_name)
    }
}

/// One container environment variable as the jobs API models it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl EnvironmentVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            secret_ref: None,
        }
    }
}

/// Ordered set of environment overrides; names are unique and later writes
/// replace earlier ones in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvOverrides(Vec<EnvironmentVar>);

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let var = EnvironmentVar::new(name, value);
        match self.0.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var,
            None => self.0.push(var),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentVar> {
        self.0.iter()
    }
}

/// A job's execution template. Only the containers are interpreted; every
/// other field is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvironmentVar>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Container {
    /// Replace the variable named `var.name`, or append it.
    pub fn set_env(&mut self, var: EnvironmentVar) {
        match self.env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => {
                existing.value = var.value;
                existing.secret_ref = var.secret_ref;
            }
            None => self.env.push(var),
        }
    }
}

impl JobTemplate {
    /// Merge `overrides` into the first container's environment.
    pub fn apply_overrides(&mut self, overrides: &EnvOverrides) -> Result<(), JobsError> {
        let first = self.containers.first_mut().ok_or(JobsError::NoContainers)?;
        for var in overrides.iter() {
            first.set_env(var.clone());
        }
        Ok(())
    }
}

/// Execution status as reported by the jobs service. Unrecognized values are
/// kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Running,
    Processing,
    Succeeded,
    Failed,
    Stopped,
    Degraded,
    Unknown,
    /// The poller gave up before the execution reached a terminal state.
    PollingAbandoned,
    Other(String),
}

impl JobStatus {
    /// Map the service's status field; absent or blank means `Unknown`.
    pub fn from_reported(status: Option<&str>) -> Self {
        match status.filter(|s| !s.trim().is_empty()) {
            Some(s) => Self::from(s.to_string()),
            None => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Processing)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "Running",
            Self::Processing => "Processing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Degraded => "Degraded",
            Self::Unknown => "Unknown",
            Self::PollingAbandoned => "PollingAbandoned",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Running" => Self::Running,
            "Processing" => Self::Processing,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Stopped" => Self::Stopped,
            "Degraded" => Self::Degraded,
            "Unknown" => Self::Unknown,
            "PollingAbandoned" => Self::PollingAbandoned,
            _ => Self::Other(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle of a started execution. The execution name never changes once
/// assigned; every status query correlates by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    #[serde(flatten)]
    pub target: JobTarget,
    pub execution_name: String,
}

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("job {0} has no template")]
    MissingTemplate(String),
    #[error("job template has no containers")]
    NoContainers,
    #[error("job {0} started without an execution name")]
    MissingExecutionName(String),
    #[error("jobs API returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("jobs API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("unexpected jobs API payload: {0}")]
    Decode(String),
}

/// The external job service.
#[async_trait]
pub trait ContainerJobs: Send + Sync {
    /// Current template of the job, `None` when the job defines none.
    async fn get_job_template(&self, target: &JobTarget) -> Result<Option<JobTemplate>, JobsError>;

    /// Start an execution, optionally with a replacement template. Returns the
    /// execution name the service assigned, if any.
    async fn start_job(&self, target: &JobTarget, template: Option<&JobTemplate>)
    -> Result<Option<String>, JobsError>;

    /// Raw status of an execution, `None` when the service reports none.
    async fn get_execution_status(&self, execution: &JobExecution) -> Result<Option<String>, JobsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> JobTemplate {
        JobTemplate {
            containers: vec![Container {
                name: "main".into(),
                image: Some("transcriber:latest".into()),
                env: vec![EnvironmentVar::new("VIDEO_URL", "old"), EnvironmentVar::new("KEEP", "1")],
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }

    #[test]
    fn overrides_replace_by_name_and_append_new() {
        let mut t = template();
        let overrides = EnvOverrides::new()
            .with("VIDEO_URL", "https://v/1.mp4")
            .with("STORAGE_BLOB_NAME", "transcripts-i/AB12.txt");
        t.apply_overrides(&overrides).unwrap();

        let env = &t.containers[0].env;
        assert_eq!(env.len(), 3);
        assert_eq!(env[0], EnvironmentVar::new("VIDEO_URL", "https://v/1.mp4"));
        assert_eq!(env[1], EnvironmentVar::new("KEEP", "1"));
        assert_eq!(env[2], EnvironmentVar::new("STORAGE_BLOB_NAME", "transcripts-i/AB12.txt"));
    }

    #[test]
    fn overrides_require_a_container() {
        let mut t = JobTemplate::default();
        let err = t.apply_overrides(&EnvOverrides::new().with("A", "1")).unwrap_err();
        assert!(matches!(err, JobsError::NoContainers));
    }

    #[test]
    fn override_set_keeps_names_unique() {
        let overrides = EnvOverrides::new().with("A", "1").with("B", "2").with("A", "3");
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.get("A"), Some("3"));
        let names: Vec<_> = overrides.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn only_running_and_processing_are_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        for s in ["Succeeded", "Failed", "Stopped", "Degraded", "Weird"] {
            assert!(JobStatus::from(s.to_string()).is_terminal(), "{s}");
        }
        assert_eq!(JobStatus::from_reported(None), JobStatus::Unknown);
        assert_eq!(JobStatus::from_reported(Some("")), JobStatus::Unknown);
        assert!(JobStatus::Unknown.is_terminal());
    }

    #[test]
    fn unknown_template_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "containers": [{
                "name": "main",
                "image": "img",
                "resources": { "cpu": 2.0, "memory": "4Gi" },
                "env": [{ "name": "S", "secretRef": "conn" }]
            }],
            "initContainers": []
        });
        let t: JobTemplate = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(t.containers[0].env[0].secret_ref.as_deref(), Some("conn"));
        assert_eq!(serde_json::to_value(&t).unwrap(), raw);
    }
}
