use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ApiError, ApiHttp};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    /// Six hex digits, with or without a leading `#`.
    pub color: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: ApiHttp,
    base_url: String,
    token: String,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(
        http: ApiHttp,
        base_url: impl Into<String>,
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Create a label; a label that already exists is a warning, not a failure.
    pub async fn create_label(&self, label: &LabelSpec) -> Result<LabelOutcome, ApiError> {
        let url = format!("{}/repos/{}/{}/labels", self.base_url, self.owner, self.repo);
        let body = serde_json::json!({
            "name": label.name,
            "color": label.color.trim_start_matches('#'),
            "description": label.description,
        });

        let result = self
            .http
            .send("create_label", false, || {
                self.http
                    .client()
                    .post(&url)
                    .bearer_auth(&self.token)
                    .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                    .header("X-GitHub-Api-Version", "2022-11-28")
                    .json(&body)
            })
            .await;

        match result {
            Ok(_) => {
                info!(label = %label.name, repo = %self.repository(), "label created");
                Ok(LabelOutcome::Created)
            }
            Err(ApiError::Upstream { status: 422, ref body, .. }) if is_already_exists(body) => {
                warn!(label = %label.name, repo = %self.repository(), "label already exists");
                Ok(LabelOutcome::AlreadyExists)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_already_exists(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("errors").and_then(|e| e.as_array()).cloned())
        .map(|errors| {
            errors
                .iter()
                .any(|e| e.get("code").and_then(|c| c.as_str()) == Some("already_exists"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_detection_reads_error_codes() {
        let body = r#"{"message":"Validation Failed","errors":[{"resource":"Label","code":"already_exists","field":"name"}]}"#;
        assert!(is_already_exists(body));
        assert!(!is_already_exists(r#"{"message":"Validation Failed","errors":[{"code":"invalid"}]}"#));
        assert!(!is_already_exists("not json"));
    }
}
