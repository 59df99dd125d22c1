use std::collections::BTreeMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ApiHttp;

/// One HTTP check against a deployed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCheck {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    /// Request headers to send, e.g. an anon API key.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Accepted statuses; empty accepts anything.
    #[serde(default)]
    pub expect_status: Vec<u16>,
    #[serde(default)]
    pub require_headers: Vec<String>,
    #[serde(default)]
    pub forbid_headers: Vec<String>,
    #[serde(default)]
    pub body_must_not_contain: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub name: String,
    pub url: String,
    pub status: Option<u16>,
    pub passed: bool,
    pub failures: Vec<String>,
}

/// Run a single probe. Probes are never retried: a flaky endpoint is a finding.
pub async fn run_probe(http: &ApiHttp, check: &ProbeCheck) -> ProbeOutcome {
    let mut failures = Vec::new();
    let mut status = None;

    match Method::from_bytes(check.method.to_ascii_uppercase().as_bytes()) {
        Err(_) => failures.push(format!("invalid method `{}`", check.method)),
        Ok(method) => {
            let mut request = http.client().request(method, &check.url);
            for (name, value) in &check.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &check.body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Err(err) => failures.push(format!("request failed: {err}")),
                Ok(resp) => {
                    let code = resp.status().as_u16();
                    status = Some(code);
                    if !check.expect_status.is_empty() && !check.expect_status.contains(&code) {
                        failures.push(format!(
                            "status {code} not in expected {:?}",
                            check.expect_status
                        ));
                    }
                    for header in &check.require_headers {
                        if !resp.headers().contains_key(header.as_str()) {
                            failures.push(format!("missing header `{header}`"));
                        }
                    }
                    for header in &check.forbid_headers {
                        if resp.headers().contains_key(header.as_str()) {
                            failures.push(format!("unexpected header `{header}`"));
                        }
                    }
                    if !check.body_must_not_contain.is_empty() {
                        let body = resp.text().await.unwrap_or_default().to_ascii_lowercase();
                        for needle in &check.body_must_not_contain {
                            if body.contains(&needle.to_ascii_lowercase()) {
                                failures.push(format!("body contains `{needle}`"));
                            }
                        }
                    }
                }
            }
        }
    }

    let passed = failures.is_empty();
    if passed {
        info!(probe = %check.name, status = ?status, "probe passed");
    } else {
        warn!(probe = %check.name, status = ?status, failures = ?failures, "probe failed");
    }
    ProbeOutcome {
        name: check.name.clone(),
        url: check.url.clone(),
        status,
        passed,
        failures,
    }
}
