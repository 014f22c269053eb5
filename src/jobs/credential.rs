//! Bearer tokens for the management API.
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::JobsError;

pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const IDENTITY_API_VERSION: &str = "2019-08-01";
/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: u64 = 300;

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, JobsError>;
}

/// A fixed token, for local development against a real subscription.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, JobsError> {
        Ok(self.0.clone())
    }
}

enum IdentityEndpoint {
    /// Container Apps / App Service identity endpoint.
    Hosted { url: String, header: String },
    /// Instance metadata service.
    Imds { url: String },
}

struct CachedToken {
    value: String,
    expires_on: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
    #[serde(default)]
    expires_in: Option<Value>,
}

fn now_secs() -> u64 {
    crate::now_ms() / 1000
}

// Identity endpoints report numbers as strings.
fn as_secs(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Managed identity of the hosting environment, with the token cached until
/// shortly before it expires.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: IdentityEndpoint,
    resource: String,
    client_id: Option<String>,
    cached: Mutex<Option<CachedToken>>,
}

impl ManagedIdentityCredential {
    /// Uses `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` when the host provides them
    /// and the metadata service otherwise. `AZURE_CLIENT_ID` selects a
    /// user-assigned identity.
    pub fn from_env(http: reqwest::Client) -> Self {
        let endpoint = match (std::env::var("IDENTITY_ENDPOINT"), std::env::var("IDENTITY_HEADER")) {
            (Ok(url), Ok(header)) if !url.is_empty() => IdentityEndpoint::Hosted { url, header },
            _ => IdentityEndpoint::Imds {
                url: IMDS_TOKEN_ENDPOINT.to_string(),
            },
        };
        let client_id = std::env::var("AZURE_CLIENT_ID").ok().filter(|s| !s.is_empty());
        Self::build(http, endpoint, client_id)
    }

    pub fn with_imds_endpoint(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self::build(http, IdentityEndpoint::Imds { url: url.into() }, None)
    }

    pub fn with_identity_endpoint(http: reqwest::Client, url: impl Into<String>, header: impl Into<String>) -> Self {
        Self::build(
            http,
            IdentityEndpoint::Hosted {
                url: url.into(),
                header: header.into(),
            },
            None,
        )
    }

    fn build(http: reqwest::Client, endpoint: IdentityEndpoint, client_id: Option<String>) -> Self {
        Self {
            http,
            endpoint,
            resource: MANAGEMENT_RESOURCE.to_string(),
            client_id,
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<CachedToken, JobsError> {
        let mut query = vec![("resource", self.resource.as_str())];
        if let Some(id) = &self.client_id {
            query.push(("client_id", id.as_str()));
        }
        let request = match &self.endpoint {
            IdentityEndpoint::Hosted { url, header } => {
                query.push(("api-version", IDENTITY_API_VERSION));
                self.http.get(url).header("X-IDENTITY-HEADER", header)
            }
            IdentityEndpoint::Imds { url } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.http.get(url).header("Metadata", "true")
            }
        };
        let response = request
            .query(&query)
            .send()
            .await
            .map_err(|e| JobsError::Credential(format!("token request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobsError::Credential(format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| JobsError::Credential(format!("unreadable token response: {e}")))?;

        let now = now_secs();
        let expires_on = token
            .expires_on
            .as_ref()
            .and_then(as_secs)
            .or_else(|| token.expires_in.as_ref().and_then(as_secs).map(|s| now + s))
            .unwrap_or(now + REFRESH_MARGIN_SECS);
        debug!(expires_on, "acquired managed identity token");
        Ok(CachedToken {
            value: token.access_token,
            expires_on,
        })
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn token(&self) -> Result<String, JobsError> {
        let mut cached = self.cached.lock().await;
        if let Some(t) = cached.as_ref()
            && t.expires_on > now_secs() + REFRESH_MARGIN_SECS
        {
            return Ok(t.value.clone());
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_numbers_may_be_strings() {
        assert_eq!(as_secs(&Value::String("3599".into())), Some(3599));
        assert_eq!(as_secs(&serde_json::json!(60)), Some(60));
        assert_eq!(as_secs(&Value::Null), None);
    }
}
