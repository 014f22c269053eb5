//! Worker configuration: an optional TOML file overlaid with environment variables.
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::jobs::arm::DEFAULT_MANAGEMENT_ENDPOINT;
use crate::jobs::{JobTarget, PollPolicy};
use crate::runtime::RetryPolicy;
use crate::sessions::catalog::{DEFAULT_LOCALE, DEFAULT_SESSION_API_URL};

pub const LOCAL_EMULATOR_ENDPOINT: &str = "http://localhost:8080";

const ENV_KEYS: &[&str] = &[
    "SUBSCRIPTION_ID",
    "RESOURCE_GROUP",
    "JOB_NAME",
    "TASKHUB",
    "ENDPOINT",
    "CREDENTIAL_MODE",
    "ACCESS_TOKEN",
    "MANAGEMENT_ENDPOINT",
    "SESSION_API_URL",
    "SESSION_LOCALE",
    "POLL_INTERVAL_SECS",
    "MAX_POLL_ATTEMPTS",
    "ACTIVITY_MAX_ATTEMPTS",
    "ACTIVITY_RETRY_BACKOFF_MS",
    "HTTP_TIMEOUT_SECS",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialMode {
    /// Static bearer token from `ACCESS_TOKEN`.
    Local,
    ManagedIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub job_name: String,
    pub taskhub: String,
    pub endpoint: String,
    /// Derived from `endpoint` when unset.
    pub credential_mode: Option<CredentialMode>,
    pub access_token: Option<String>,
    pub management_endpoint: String,
    pub session_api_url: String,
    pub session_locale: String,
    pub poll_interval_secs: u64,
    /// 0 polls without limit.
    pub max_poll_attempts: u32,
    pub activity_max_attempts: u32,
    pub activity_retry_backoff_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            resource_group: String::new(),
            job_name: String::new(),
            taskhub: "default".to_string(),
            endpoint: LOCAL_EMULATOR_ENDPOINT.to_string(),
            credential_mode: None,
            access_token: None,
            management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            session_api_url: DEFAULT_SESSION_API_URL.to_string(),
            session_locale: DEFAULT_LOCALE.to_string(),
            poll_interval_secs: 10,
            max_poll_attempts: 8640,
            activity_max_attempts: 1,
            activity_retry_backoff_ms: 1000,
            http_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn credential_mode(&self) -> CredentialMode {
        self.credential_mode.unwrap_or(if self.endpoint == LOCAL_EMULATOR_ENDPOINT {
            CredentialMode::Local
        } else {
            CredentialMode::ManagedIdentity
        })
    }

    pub fn job_target(&self) -> JobTarget {
        JobTarget::new(&self.subscription_id, &self.resource_group, &self.job_name)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval_ms: self.poll_interval_secs.saturating_mul(1000),
            max_polls: (self.max_poll_attempts > 0).then_some(self.max_poll_attempts),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.activity_max_attempts,
            Duration::from_millis(self.activity_retry_backoff_ms),
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("SUBSCRIPTION_ID", &self.subscription_id),
            ("RESOURCE_GROUP", &self.resource_group),
            ("JOB_NAME", &self.job_name),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key));
            }
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_SECS must be greater than 0".into()));
        }
        if self.activity_max_attempts == 0 {
            return Err(ConfigError::Invalid("ACTIVITY_MAX_ATTEMPTS must be greater than 0".into()));
        }
        if self.credential_mode() == CredentialMode::Local
            && self.access_token.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            return Err(ConfigError::Missing("ACCESS_TOKEN"));
        }
        Ok(())
    }
}

/// Load configuration from an optional TOML file with environment variable overrides.
pub fn load_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        figment = figment.merge(Toml::file(path));
    }
    from_figment(figment.merge(Env::raw().only(ENV_KEYS)))
}

/// Load configuration from a TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<WorkerConfig, ConfigError> {
    from_figment(Figment::new().merge(Toml::string(toml_str)))
}

fn from_figment(figment: Figment) -> Result<WorkerConfig, ConfigError> {
    let config: WorkerConfig = figment.extract().map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
