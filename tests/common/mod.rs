#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use transcribe_fanout::jobs::activities::{get_job_execution_status, start_job_execution};
use transcribe_fanout::jobs::{
    Container, ContainerJobs, EnvironmentVar, GET_JOB_EXECUTION_STATUS, JobExecution, JobTarget, JobTemplate,
    JobsError, START_JOB_EXECUTION, StartJobRequest,
};
use transcribe_fanout::providers::HistoryStore;
use transcribe_fanout::sessions::{CatalogError, SessionCatalog, SessionLookup};
use transcribe_fanout::{Action, Event};

pub async fn wait_for_history<F>(store: &dyn HistoryStore, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate(&store.read(instance).await) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn target() -> JobTarget {
    JobTarget::new("sub", "rg", "transcribe-video-job")
}

pub fn default_template() -> JobTemplate {
    JobTemplate {
        containers: vec![Container {
            name: "transcriber".into(),
            image: Some("registry.example/transcribe-video-job:latest".into()),
            env: vec![
                EnvironmentVar::new("VIDEO_URL", "https://example/default.mp4"),
                EnvironmentVar::new("STORAGE_ACCOUNT_URL", "https://acct.blob.example"),
            ],
            extra: Map::new(),
        }],
        extra: Map::new(),
    }
}

/// Scripted job service. Every execution walks the same status script; the
/// last entry repeats.
pub struct FakeJobs {
    template: Option<JobTemplate>,
    script: Vec<Option<String>>,
    fail_start_for: Option<String>,
    blank_execution_names: bool,
    pub template_fetches: AtomicUsize,
    pub starts: Mutex<Vec<Option<JobTemplate>>>,
    pub status_queries: Mutex<Vec<String>>,
}

impl FakeJobs {
    pub fn new(script: &[&str]) -> Self {
        Self::with_raw_statuses(script.iter().map(|s| Some(s.to_string())).collect())
    }

    pub fn with_raw_statuses(script: Vec<Option<String>>) -> Self {
        Self {
            template: Some(default_template()),
            script,
            fail_start_for: None,
            blank_execution_names: false,
            template_fetches: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            status_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn without_template(mut self) -> Self {
        self.template = None;
        self
    }

    pub fn with_template(mut self, template: JobTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Starts whose `VIDEO_URL` override equals `video_url` are rejected.
    pub fn failing_for(mut self, video_url: &str) -> Self {
        self.fail_start_for = Some(video_url.to_string());
        self
    }

    pub fn with_blank_execution_names(mut self) -> Self {
        self.blank_execution_names = true;
        self
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn queries_for(&self, execution_name: &str) -> usize {
        self.status_queries
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == execution_name)
            .count()
    }
}

#[async_trait]
impl ContainerJobs for FakeJobs {
    async fn get_job_template(&self, _target: &JobTarget) -> Result<Option<JobTemplate>, JobsError> {
        self.template_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.template.clone())
    }

    async fn start_job(
        &self,
        _target: &JobTarget,
        template: Option<&JobTemplate>,
    ) -> Result<Option<String>, JobsError> {
        let video_url = template
            .and_then(|t| t.containers.first())
            .and_then(|c| c.env.iter().find(|e| e.name == "VIDEO_URL"))
            .and_then(|e| e.value.clone());
        if self.fail_start_for.is_some() && video_url == self.fail_start_for {
            return Err(JobsError::Http {
                status: 409,
                body: "conflict".into(),
            });
        }
        let mut starts = self.starts.lock().unwrap();
        starts.push(template.cloned());
        if self.blank_execution_names {
            return Ok(Some(String::new()));
        }
        Ok(Some(format!("exec-{}", starts.len())))
    }

    async fn get_execution_status(&self, execution: &JobExecution) -> Result<Option<String>, JobsError> {
        let mut queries = self.status_queries.lock().unwrap();
        let seen = queries.iter().filter(|n| **n == execution.execution_name).count();
        queries.push(execution.execution_name.clone());
        let idx = seen.min(self.script.len().saturating_sub(1));
        Ok(self.script.get(idx).cloned().flatten())
    }
}

/// Session service backed by a fixed table; unknown codes answer 404.
#[derive(Default)]
pub struct FakeCatalog {
    entries: HashMap<String, SessionLookup>,
    pub lookups: Mutex<Vec<String>>,
}

impl FakeCatalog {
    pub fn with_video(mut self, code: &str, video_url: &str) -> Self {
        self.entries.insert(
            code.to_string(),
            SessionLookup::Found {
                video_url: video_url.to_string(),
            },
        );
        self
    }

    pub fn with_lookup(mut self, code: &str, lookup: SessionLookup) -> Self {
        self.entries.insert(code.to_string(), lookup);
        self
    }
}

#[async_trait]
impl SessionCatalog for FakeCatalog {
    async fn lookup(&self, session_code: &str) -> Result<SessionLookup, CatalogError> {
        self.lookups.lock().unwrap().push(session_code.to_string());
        Ok(self
            .entries
            .get(session_code)
            .cloned()
            .unwrap_or(SessionLookup::Unavailable { status: 404 }))
    }
}

/// Materialize job actions synchronously against `jobs`, for driving the
/// poller with `Executor::drive_to_completion`. Timers fire immediately.
pub fn run_job_actions(jobs: &FakeJobs, actions: Vec<Action>, history: &mut Vec<Event>) {
    for action in actions {
        match action {
            Action::CallActivity { id, name, input } => {
                let outcome = match name.as_str() {
                    START_JOB_EXECUTION => {
                        let request: StartJobRequest = serde_json::from_str(&input).unwrap();
                        futures::executor::block_on(start_job_execution(jobs, &request)).map_err(|e| e.to_string())
                    }
                    GET_JOB_EXECUTION_STATUS => {
                        let execution: JobExecution = serde_json::from_str(&input).unwrap();
                        futures::executor::block_on(get_job_execution_status(jobs, &execution))
                            .map(|s| s.to_string())
                            .map_err(|e| e.to_string())
                    }
                    other => Err(format!("unexpected activity {other}")),
                };
                history.push(match outcome {
                    Ok(result) => Event::ActivityCompleted { id, result },
                    Err(error) => Event::ActivityFailed { id, error },
                });
            }
            Action::CreateTimer { id, .. } => history.push(Event::TimerFired { id, fire_at_ms: 0 }),
            other => panic!("unexpected action {other:?}"),
        }
    }
}
