//! Sheet synchronization: column resolution, row matching, upsert planning
//! and the engine that applies plans, plus the file formats that feed them.

pub mod columns;
pub mod config;
pub mod engine;
pub mod matcher;
pub mod planner;
pub mod presets;

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use trackr_core::{BusinessKey, ManifestEntry};
use trackr_report::Document;
use trackr_storage::{
    run_probe, ApiError, ApiHttp, DeliverableStore, GitHubClient, LabelOutcome, LabelSpec, ProbeCheck,
    ProbeOutcome, StoredDeliverable,
};

pub use columns::{resolve_columns, resolve_columns_lenient, ColumnMap, FieldSpec, ResolveError};
pub use config::{ConfigError, GitHubConfig, ProbeConfig, SmartsheetConfig, SyncConfig};
pub use engine::{
    write_sync_report, AppliedRecord, AttachOutcome, AttachReport, DeleteReport, RecordFailure, RecordOutcome,
    SyncEngine, SyncError, SyncReport,
};
pub use matcher::{
    find_duplicate_keys, find_insert_position, find_row_by_key, next_subtask_key, DuplicateKeyWarning, RowLookup,
};
pub use planner::{plan_upsert, DuplicatePolicy, PlanError, PlannedUpsert, SyncMapping, SyncRecord, UpsertPlan};
pub use presets::{PresetRegistry, DEFAULT_PRESET};

pub const CRATE_NAME: &str = "trackr-sync";

const BUILTIN_LABELS: &str = include_str!("../config/labels.yaml");

#[derive(Debug, Deserialize)]
struct RecordFile {
    records: Vec<SyncRecord>,
}

/// Read desired rows from a YAML or JSON file with a top-level `records` list.
pub async fn load_records(path: &Path) -> Result<Vec<SyncRecord>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_records(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_records(raw: &str) -> Result<Vec<SyncRecord>> {
    let file: RecordFile = serde_yaml::from_str(raw)?;
    Ok(file.records)
}

#[derive(Debug, Deserialize)]
struct LabelFile {
    labels: Vec<LabelSpec>,
}

pub fn default_labels() -> Result<Vec<LabelSpec>> {
    parse_labels(BUILTIN_LABELS).context("parsing built-in labels")
}

pub async fn load_labels(path: &Path) -> Result<Vec<LabelSpec>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_labels(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_labels(raw: &str) -> Result<Vec<LabelSpec>> {
    let file: LabelFile = serde_yaml::from_str(raw)?;
    for label in &file.labels {
        let color = label.color.trim_start_matches('#');
        if color.len() != 6 || !color.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("label `{}` has invalid color `{}`", label.name, label.color);
        }
    }
    Ok(file.labels)
}

/// Create each label in order; labels that already exist are counted, not fatal.
pub async fn sync_labels(client: &GitHubClient, labels: &[LabelSpec]) -> Result<Vec<(String, LabelOutcome)>, ApiError> {
    let mut outcomes = Vec::with_capacity(labels.len());
    for label in labels {
        let outcome = client.create_label(label).await?;
        outcomes.push((label.name.clone(), outcome));
    }
    let existing = outcomes
        .iter()
        .filter(|(_, o)| *o == LabelOutcome::AlreadyExists)
        .count();
    info!(
        repository = %client.repository(),
        created = outcomes.len() - existing,
        existing,
        "labels synced"
    );
    Ok(outcomes)
}

#[derive(Debug, Deserialize)]
struct ProbeChecklist {
    probes: Vec<ProbeCheck>,
}

/// Parse a checklist and fill `{base}` and `{supabase_token}` placeholders.
pub fn parse_probe_checklist(raw: &str, config: &ProbeConfig) -> Result<Vec<ProbeCheck>> {
    let checklist: ProbeChecklist = serde_yaml::from_str(raw)?;
    checklist
        .probes
        .into_iter()
        .map(|mut check| -> Result<ProbeCheck> {
            check.url = substitute(&check.url, config)?;
            for value in check.headers.values_mut() {
                *value = substitute(value, config)?;
            }
            Ok(check)
        })
        .collect()
}

pub async fn load_probe_checklist(path: &Path, config: &ProbeConfig) -> Result<Vec<ProbeCheck>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_probe_checklist(&raw, config).with_context(|| format!("parsing {}", path.display()))
}

fn substitute(template: &str, config: &ProbeConfig) -> Result<String> {
    let mut out = template.to_string();
    if out.contains("{base}") {
        let Some(base) = config.base_url.as_deref() else {
            return Err(ConfigError::Missing("PROBE_BASE_URL").into());
        };
        out = out.replace("{base}", base);
    }
    if out.contains("{supabase_token}") {
        let Some(token) = config.supabase_token.as_deref() else {
            return Err(ConfigError::Missing("SUPABASE_ACCESS_TOKEN").into());
        };
        out = out.replace("{supabase_token}", token);
    }
    Ok(out)
}

/// Run every probe; the caller decides what a failure means.
pub async fn run_probes(http: &ApiHttp, checks: &[ProbeCheck]) -> Vec<ProbeOutcome> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let outcome = run_probe(http, check).await;
        if !outcome.passed {
            warn!(probe = %outcome.name, failures = ?outcome.failures, "probe failed");
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Render `document`, store it as a deliverable and record it under `key`.
pub async fn publish_report(
    store: &DeliverableStore,
    document: &Document,
    key: &BusinessKey,
) -> Result<(StoredDeliverable, ManifestEntry)> {
    let bytes = trackr_report::render(document).context("rendering report")?;
    let file_name = document.file_name_for(&key.to_string());
    let stored = store.store_bytes(&file_name, &bytes).await?;
    let entry = store.record_deliverable(key, &stored).await?;
    info!(
        key = %key,
        file = %stored.relative_path.display(),
        bytes = stored.byte_size,
        unchanged = stored.unchanged,
        "report published"
    );
    Ok((stored, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackr_core::{CellValue, TaskKey};

    #[test]
    fn records_accept_numeric_and_text_keys() {
        let records = parse_records(
            r#"
records:
  - key: 1.10
    fields:
      Task Name: Tech stack analysis
      "% Complete": 1
  - key: "1.9.2"
    parent: 1.9
    fields:
      Status: In Progress
  - key: SEC-7
"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, BusinessKey::Task(TaskKey::new(1, 10, None)));
        assert_eq!(records[0].fields["% Complete"], CellValue::Number(1.0));
        assert_eq!(records[1].parent, Some(BusinessKey::Task(TaskKey::new(1, 90, None))));
        assert_eq!(records[2].key, BusinessKey::Text("SEC-7".into()));
    }

    #[test]
    fn builtin_labels_are_valid() {
        let labels = default_labels().unwrap();
        assert!(labels.iter().any(|l| l.name == "security"));
        assert!(parse_labels("labels:\n  - name: x\n    color: red\n").is_err());
    }

    #[test]
    fn probe_placeholders_are_filled() {
        let raw = r#"
probes:
  - name: profiles need auth
    url: "{base}/rest/v1/profiles"
    headers:
      apikey: "{supabase_token}"
    expect_status: [401]
"#;
        let config = ProbeConfig {
            base_url: Some("https://abcd.supabase.co".into()),
            supabase_token: Some("anon".into()),
        };
        let checks = parse_probe_checklist(raw, &config).unwrap();
        assert_eq!(checks[0].url, "https://abcd.supabase.co/rest/v1/profiles");
        assert_eq!(checks[0].headers["apikey"], "anon");

        let err = parse_probe_checklist(raw, &ProbeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("PROBE_BASE_URL"));
    }
}
