//! Fan-out/fan-in over video sessions: one transcription job per session,
//! joined into a single result list.
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::jobs::{EnvOverrides, JOB_EXECUTION_ORCHESTRATION, JobExecutionRequest, JobStatus, JobTarget, PollPolicy, StartJobRequest};
use crate::sessions::{RESOLVE_VIDEO_SESSIONS, VideoSession};
use crate::{OrchestrationContext, ReplaySafeLogger};

pub const FAN_OUT_ORCHESTRATION: &str = "VideoTranscriptFanOutFanIn";
pub const VIDEO_URL_ENV: &str = "VIDEO_URL";
pub const BLOB_NAME_ENV: &str = "STORAGE_BLOB_NAME";

/// Blob name the job writes the transcript of `session_code` to.
pub fn transcript_path(instance_id: &str, session_code: &str) -> String {
    format!("transcripts-{instance_id}/{session_code}.txt")
}

/// Job every branch runs, and how branches poll it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub target: JobTarget,
    #[serde(default)]
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum BranchOutcome {
    /// The job reached a terminal status, which may itself be a failure.
    Completed { status: JobStatus },
    /// The branch orchestration failed before reporting a status.
    Failed { error: String },
}

impl BranchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { status: JobStatus::Succeeded })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptResult {
    #[serde(flatten)]
    pub session: VideoSession,
    #[serde(flatten)]
    pub outcome: BranchOutcome,
}

/// Orchestration body registered as `VideoTranscriptFanOutFanIn`.
///
/// Every resolved session appears exactly once in the result, in resolution
/// order. A failed branch is reported in its row; it does not fail the whole
/// run.
pub async fn transcribe_sessions(
    ctx: OrchestrationContext,
    settings: Arc<TranscriptionSettings>,
    selectors: Vec<String>,
) -> Result<Vec<TranscriptResult>, String> {
    let log = ReplaySafeLogger::new(&ctx, "fan-out");
    log.info(format!(
        "Starting fan out/fan in orchestration with {} items for job {}",
        selectors.len(),
        settings.target
    ));

    let sessions: Vec<VideoSession> = ctx
        .schedule_activity_typed(RESOLVE_VIDEO_SESSIONS, &selectors)?
        .into_activity_typed()
        .await?;

    let instance = ctx.instance_id();
    let mut resolved = Vec::with_capacity(sessions.len());
    let mut branches = Vec::with_capacity(sessions.len());
    for mut session in sessions {
        let path = transcript_path(&instance, &session.session_code);
        let env = EnvOverrides::new()
            .with(VIDEO_URL_ENV, &session.video_url)
            .with(BLOB_NAME_ENV, &path);
        let request = JobExecutionRequest {
            start: StartJobRequest {
                target: settings.target.clone(),
                env,
            },
            poll: settings.poll,
        };
        branches.push(ctx.schedule_sub_orchestration_typed(JOB_EXECUTION_ORCHESTRATION, &request)?);
        session.transcript_path = Some(path);
        resolved.push(session);
    }

    log.info(format!("Waiting for {} parallel tasks to complete", branches.len()));
    let outputs = ctx.join(branches).await;

    let results: Vec<TranscriptResult> = resolved
        .into_iter()
        .zip(outputs)
        .map(|(session, output)| {
            let outcome = match output.into_sub_orchestration_typed::<JobStatus>() {
                Ok(status) => BranchOutcome::Completed { status },
                Err(error) => BranchOutcome::Failed { error },
            };
            TranscriptResult { session, outcome }
        })
        .collect();

    let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
    log.info(format!("{succeeded} of {} transcription jobs succeeded", results.len()));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_path_is_stable() {
        assert_eq!(transcript_path("inst-1", "AB12"), "transcripts-inst-1/AB12.txt");
        assert_eq!(transcript_path("inst-1", "AB12"), transcript_path("inst-1", "AB12"));
    }

    #[test]
    fn result_rows_flatten_session_and_outcome() {
        let row = TranscriptResult {
            session: VideoSession {
                session_code: "AB12".into(),
                video_url: "https://v/ab12.mp4".into(),
                transcript_path: Some("transcripts-i/AB12.txt".into()),
            },
            outcome: BranchOutcome::Completed {
                status: JobStatus::Succeeded,
            },
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "session_code": "AB12",
                "video_url": "https://v/ab12.mp4",
                "transcript_path": "transcripts-i/AB12.txt",
                "outcome": "Completed",
                "status": "Succeeded"
            })
        );
        let back: TranscriptResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }
}
