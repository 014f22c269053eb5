use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{CatalogError, SessionCatalog, SessionLookup};

pub const DEFAULT_SESSION_API_URL: &str = "https://api-v2.build.microsoft.com/api/session";
pub const DEFAULT_LOCALE: &str = "en-US";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    #[serde(default)]
    download_video_link: Option<String>,
}

/// Session metadata service, one GET per code at `{base_url}/{locale}-{code}`.
pub struct HttpSessionCatalog {
    http: reqwest::Client,
    base_url: String,
    locale: String,
}

impl HttpSessionCatalog {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, locale: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            locale: locale.into(),
        }
    }

    pub fn session_url(&self, session_code: &str) -> String {
        format!("{}/{}-{}", self.base_url, self.locale, session_code)
    }
}

#[async_trait]
impl SessionCatalog for HttpSessionCatalog {
    async fn lookup(&self, session_code: &str) -> Result<SessionLookup, CatalogError> {
        let response = self.http.get(self.session_url(session_code)).send().await?;
        if response.status() != StatusCode::OK {
            return Ok(SessionLookup::Unavailable {
                status: response.status().as_u16(),
            });
        }
        let info: SessionInfo = response.json().await.map_err(|e| CatalogError::Decode {
            code: session_code.to_string(),
            reason: e.to_string(),
        })?;
        Ok(match info.download_video_link.filter(|link| !link.is_empty()) {
            Some(video_url) => SessionLookup::Found { video_url },
            None => SessionLookup::NoDownloadLink,
        })
    }
}
