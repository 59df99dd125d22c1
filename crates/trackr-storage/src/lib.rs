//! Deliverable storage + retrying HTTP plumbing for trackr.

mod github;
mod probe;
mod smartsheet;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use trackr_core::{BusinessKey, DeliverableManifest, ManifestEntry, RowId, SheetId};
use uuid::Uuid;

pub use github::{GitHubClient, LabelOutcome, LabelSpec, DEFAULT_GITHUB_API_URL};
pub use probe::{run_probe, ProbeCheck, ProbeOutcome};
pub use smartsheet::{SheetApi, SmartsheetClient, DEFAULT_SMARTSHEET_BASE_URL};

pub const CRATE_NAME: &str = "trackr-storage";

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Upper bound on how long a `Retry-After` header may park a request.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct StoredDeliverable {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Directory of generated deliverables plus the manifest describing them.
#[derive(Debug, Clone)]
pub struct DeliverableStore {
    root: PathBuf,
}

impl DeliverableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write a deliverable with an atomic temp-file rename.
    ///
    /// Rewriting identical content is skipped and reported as `unchanged`.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredDeliverable> {
        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name == "."
            || file_name == ".."
            || file_name == MANIFEST_FILE_NAME
        {
            bail!("invalid deliverable file name `{file_name}`");
        }

        let content_hash = Self::sha256_hex(bytes);
        let relative_path = PathBuf::from(file_name);
        let absolute_path = self.root.join(&relative_path);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating deliverables directory {}", self.root.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking deliverable path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading existing deliverable {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredDeliverable {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredDeliverable {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    pub async fn load_manifest(&self) -> anyhow::Result<DeliverableManifest> {
        load_manifest(&self.manifest_path()).await
    }

    pub async fn save_manifest(&self, manifest: &DeliverableManifest) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating deliverables directory {}", self.root.display()))?;
        let bytes = serde_json::to_vec_pretty(manifest).context("serializing deliverable manifest")?;
        write_atomic(&self.manifest_path(), &bytes).await
    }

    /// Record a stored deliverable under `key` in the on-disk manifest.
    pub async fn record_deliverable(
        &self,
        key: &BusinessKey,
        stored: &StoredDeliverable,
    ) -> anyhow::Result<ManifestEntry> {
        let mut manifest = self.load_manifest().await?;
        let entry = ManifestEntry {
            task_key: key.clone(),
            file_path: stored.relative_path.clone(),
            sha256: stored.content_hash.clone(),
            bytes: stored.byte_size as u64,
            generated_at: Utc::now(),
        };
        manifest.record(entry.clone());
        self.save_manifest(&manifest).await?;
        Ok(entry)
    }
}

/// Read a manifest file; a missing file is an empty manifest.
pub async fn load_manifest(path: &Path) -> anyhow::Result<DeliverableManifest> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking manifest {}", path.display()))?
    {
        return Ok(DeliverableManifest::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading manifest {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing manifest {}", path.display()))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        body: String,
    },
    #[error("attachment `{file_name}` already exists on row {row_id}")]
    Conflict { row_id: RowId, file_name: String },
    #[error("sheet {sheet_id} changed upstream (expected version {expected}, found {actual})")]
    StaleWrite {
        sheet_id: SheetId,
        expected: u64,
        actual: u64,
    },
    #[error("batch partially applied: {applied} row(s) written, {failed} rejected: {detail}")]
    PartialBatch {
        applied: usize,
        failed: usize,
        detail: String,
    },
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    async fn from_response(resp: Response) -> Self {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.chars().take(300).collect())
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown status").to_string());
        Self::Upstream {
            status: status.as_u16(),
            message,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Rate limiting is always retried; server errors only when replaying the request is safe.
pub fn classify_status(status: StatusCode, idempotent: bool) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || (idempotent && status.is_server_error()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, idempotent: bool) -> RetryDisposition {
    if err.is_connect() || (idempotent && err.is_timeout()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter <= 0.0 {
            return delay;
        }
        let shave = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 - shave)
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("trackr/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared reqwest client that replays requests per [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ApiHttp {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ApiHttp {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Send the request produced by `build`, rebuilding it for every retry.
    ///
    /// Non-2xx responses that are not retried come back as [`ApiError::Upstream`].
    pub async fn send<F>(&self, call: &str, idempotent: bool, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let span = info_span!("api_call", call, idempotent);
        async {
            let mut attempt = 0usize;
            loop {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }

                        if classify_status(status, idempotent) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let backoff = self.backoff.jittered_delay(attempt);
                            let delay = retry_after(&resp)
                                .map(|hint| hint.min(MAX_RETRY_AFTER).max(backoff))
                                .unwrap_or(backoff);
                            warn!(
                                status = status.as_u16(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying after upstream status"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(ApiError::from_response(resp).await);
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err, idempotent) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.jittered_delay(attempt);
                            warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying after transport error");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(ApiError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn send_json<T, F>(&self, call: &str, idempotent: bool, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let resp = self.send(call, idempotent, build).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
            context: call.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn deliverable_hashing_is_stable() {
        let hash = DeliverableStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn rewriting_identical_content_is_reported_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = DeliverableStore::new(dir.path().join("deliverables"));

        let first = store
            .store_bytes("1.1-Tech-Stack-Analysis-Report.docx", b"v1")
            .await
            .expect("first store");
        let second = store
            .store_bytes("1.1-Tech-Stack-Analysis-Report.docx", b"v1")
            .await
            .expect("second store");
        let third = store
            .store_bytes("1.1-Tech-Stack-Analysis-Report.docx", b"v2")
            .await
            .expect("third store");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert!(!third.unchanged);
        assert_ne!(first.content_hash, third.content_hash);
        assert_eq!(std::fs::read(&third.absolute_path).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn file_names_with_separators_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = DeliverableStore::new(dir.path());
        assert!(store.store_bytes("../escape.docx", b"x").await.is_err());
        assert!(store.store_bytes(MANIFEST_FILE_NAME, b"x").await.is_err());
    }

    #[tokio::test]
    async fn manifest_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = DeliverableStore::new(dir.path());
        assert!(store.load_manifest().await.unwrap().entries.is_empty());

        let stored = store.store_bytes("2.3-Audit.docx", b"report").await.unwrap();
        let key = BusinessKey::parse("2.3");
        store.record_deliverable(&key, &stored).await.unwrap();
        store.record_deliverable(&key, &stored).await.unwrap();

        let manifest = store.load_manifest().await.unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].task_key, key);
        assert_eq!(manifest.entries[0].file_path, PathBuf::from("2.3-Audit.docx"));
        assert_eq!(manifest.entries[0].bytes, 6);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_only_shortens_delays() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let delay = policy.jittered_delay(0);
            assert!(delay <= Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(200));
        }
    }

    #[test]
    fn writes_only_retry_on_rate_limit() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, false),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, true),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, true),
            RetryDisposition::NonRetryable
        );
    }
}
