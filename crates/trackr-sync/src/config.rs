use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use trackr_core::SheetId;
use trackr_storage::{HttpClientConfig, DEFAULT_GITHUB_API_URL, DEFAULT_SMARTSHEET_BASE_URL};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Non-secret settings; every value has a default.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reports_dir: PathBuf,
    pub deliverables_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            reports_dir: optional(&lookup, "TRACKR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            deliverables_dir: optional(&lookup, "TRACKR_DELIVERABLES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./deliverables")),
            http_timeout_secs: optional(&lookup, "TRACKR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: optional(&lookup, "TRACKR_USER_AGENT")
                .unwrap_or_else(|| format!("trackr/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartsheetConfig {
    pub token: String,
    pub sheet_id: SheetId,
    pub base_url: String,
}

impl SmartsheetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = required(&lookup, "SMARTSHEET_API_TOKEN")?;
        let raw_sheet_id = required(&lookup, "SMARTSHEET_SHEET_ID")?;
        let sheet_id = raw_sheet_id.parse().map_err(|_| ConfigError::Invalid {
            name: "SMARTSHEET_SHEET_ID",
            reason: format!("`{raw_sheet_id}` is not a numeric sheet id"),
        })?;
        Ok(Self {
            token,
            sheet_id,
            base_url: optional(&lookup, "SMARTSHEET_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SMARTSHEET_BASE_URL.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub api_url: String,
}

impl GitHubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = required(&lookup, "GITHUB_TOKEN")?;
        let repository = required(&lookup, "GITHUB_REPOSITORY")?;
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| ConfigError::Invalid {
                name: "GITHUB_REPOSITORY",
                reason: format!("`{repository}` is not of the form owner/repo"),
            })?;
        Ok(Self {
            token,
            owner: owner.to_string(),
            repo: repo.to_string(),
            api_url: optional(&lookup, "GITHUB_API_URL").unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
        })
    }
}

/// Substitutions for probe checklists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeConfig {
    pub base_url: Option<String>,
    pub supabase_token: Option<String>,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base_url = optional(&lookup, "PROBE_BASE_URL").or_else(|| {
            optional(&lookup, "SUPABASE_PROJECT_ID").map(|id| format!("https://{id}.supabase.co"))
        });
        Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            supabase_token: optional(&lookup, "SUPABASE_ACCESS_TOKEN"),
        }
    }
}
