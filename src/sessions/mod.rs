//! Resolve session codes to downloadable videos.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

pub mod catalog;

pub use catalog::HttpSessionCatalog;

pub const RESOLVE_VIDEO_SESSIONS: &str = "ResolveVideoSessions";

/// One unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSession {
    pub session_code: String,
    pub video_url: String,
    /// Set by the fan-out orchestration before the job is started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

/// Outcome of looking up one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Found { video_url: String },
    NoDownloadLink,
    Unavailable { status: u16 },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("session lookup failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected session payload for {code}: {reason}")]
    Decode { code: String, reason: String },
}

#[async_trait]
pub trait SessionCatalog: Send + Sync {
    /// Look up a normalized session code.
    async fn lookup(&self, session_code: &str) -> Result<SessionLookup, CatalogError>;
}

pub fn normalize_session_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Resolve selectors to sessions, in input order.
///
/// Codes are normalized and looked up once each. Unknown sessions and
/// sessions without a video are logged and left out; transport errors fail
/// the whole call.
pub async fn resolve_video_sessions(
    catalog: &dyn SessionCatalog,
    selectors: &[String],
) -> Result<Vec<VideoSession>, CatalogError> {
    let mut seen = HashSet::new();
    let mut sessions = Vec::new();
    for raw in selectors {
        let code = normalize_session_code(raw);
        if code.is_empty() || !seen.insert(code.clone()) {
            continue;
        }
        info!(session = %code, "processing session code");
        match catalog.lookup(&code).await? {
            SessionLookup::Found { video_url } => sessions.push(VideoSession {
                session_code: code,
                video_url,
                transcript_path: None,
            }),
            SessionLookup::NoDownloadLink => warn!(session = %code, "session has no downloadable video"),
            SessionLookup::Unavailable { status } => warn!(session = %code, status, "session lookup failed"),
        }
    }
    Ok(sessions)
}
