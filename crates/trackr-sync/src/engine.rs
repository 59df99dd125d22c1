//! Applies plans against the live sheet.
//!
//! Every write is preceded by a version check against the snapshot the plan
//! was built from. A mismatch refetches the sheet and replans once; a second
//! mismatch fails the record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};
use trackr_core::{
    BusinessKey, Cell, CellValue, ColumnId, DeliverableManifest, RowId, RowWrite, Sheet, SheetId, TaskKey,
};
use trackr_storage::{ApiError, DeliverableStore, SheetApi};
use uuid::Uuid;

use crate::columns::{resolve_columns_lenient, ColumnMap};
use crate::matcher::{find_duplicate_keys, find_row_by_key, next_subtask_key, DuplicateKeyWarning};
use crate::planner::{plan_upsert, PlanError, SyncMapping, SyncRecord, UpsertPlan};

pub const SYNC_REPORT_FILE_NAME: &str = "sync_report.json";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    /// Failures that concern one record and leave the rest of a batch runnable.
    fn is_record_scoped(&self) -> bool {
        match self {
            Self::Plan(_) => true,
            Self::Api(ApiError::StaleWrite { .. } | ApiError::PartialBatch { .. }) => true,
            Self::Api(ApiError::Upstream { status, .. }) => matches!(status, 400 | 404 | 422),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted { row_id: Option<RowId> },
    Updated { row_id: RowId, cells: usize },
    Unchanged { row_id: RowId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    pub key: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<DuplicateKeyWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of one batch run, persisted under `<reports>/<runId>/`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub preset: String,
    pub sheet_id: SheetId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub records: Vec<AppliedRecord>,
    pub failures: Vec<RecordFailure>,
    pub warnings: Vec<DuplicateKeyWarning>,
}

impl SyncReport {
    fn start(preset: &str, sheet_id: SheetId) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            preset: preset.to_string(),
            sheet_id,
            started_at: now,
            finished_at: now,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            records: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push(&mut self, applied: AppliedRecord) {
        match applied.outcome {
            RecordOutcome::Inserted { .. } => self.inserted += 1,
            RecordOutcome::Updated { .. } => self.updated += 1,
            RecordOutcome::Unchanged { .. } => self.unchanged += 1,
        }
        self.records.push(applied);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.warnings.is_empty()
    }

    pub fn brief_markdown(&self) -> String {
        let failures = if self.failures.is_empty() {
            "- none".to_string()
        } else {
            self.failures
                .iter()
                .map(|f| format!("- `{}`: {}", f.key, f.error))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let warnings = if self.warnings.is_empty() {
            "- none".to_string()
        } else {
            self.warnings
                .iter()
                .map(|w| format!("- {w}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "# Sync Run\n\n- Run ID: `{}`\n- Preset: {}\n- Sheet: {}\n- Started: {}\n- Finished: {}\n- Inserted: {}\n- Updated: {}\n- Unchanged: {}\n\n## Failures\n{}\n\n## Warnings\n{}\n",
            self.run_id,
            self.preset,
            self.sheet_id,
            self.started_at,
            self.finished_at,
            self.inserted,
            self.updated,
            self.unchanged,
            failures,
            warnings
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<RowId>,
    pub missing: Vec<String>,
    pub conflicts: Vec<DuplicateKeyWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachOutcome {
    Uploaded { row_id: RowId, attachment_id: u64 },
    AlreadyAttached { row_id: RowId },
    RowMissing,
    DuplicateKey { row_ids: Vec<RowId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachReport {
    pub key: String,
    pub file: String,
    #[serde(flatten)]
    pub outcome: AttachOutcome,
}

/// Keeps one sheet snapshot in step with the writes it issues.
pub struct SyncEngine<'a, A: SheetApi> {
    api: &'a A,
    mapping: SyncMapping,
    sheet: Sheet,
    columns: ColumnMap,
}

impl<'a, A: SheetApi> SyncEngine<'a, A> {
    pub async fn connect(api: &'a A, sheet_id: SheetId, mapping: SyncMapping) -> Result<Self, SyncError> {
        let sheet = api.get_sheet(sheet_id).await?;
        let columns = resolve_columns_lenient(&sheet, &mapping.field_specs());
        info!(
            sheet_id,
            sheet = %sheet.name,
            rows = sheet.rows.len(),
            version = ?sheet.version,
            preset = %mapping.name,
            "sheet loaded"
        );
        Ok(Self {
            api,
            mapping,
            sheet,
            columns,
        })
    }

    pub fn sheet(&self) -> &Sheet {
        &self.sheet
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    pub fn mapping(&self) -> &SyncMapping {
        &self.mapping
    }

    pub async fn refresh(&mut self) -> Result<(), ApiError> {
        self.sheet = self.api.get_sheet(self.sheet.id).await?;
        self.columns = resolve_columns_lenient(&self.sheet, &self.mapping.field_specs());
        Ok(())
    }

    fn key_column(&self) -> Result<ColumnId, PlanError> {
        Ok(self.columns.require(&self.mapping.key.name)?)
    }

    async fn ensure_current(&self) -> Result<(), ApiError> {
        let actual = self.api.get_sheet_version(self.sheet.id).await?;
        match self.sheet.version {
            Some(expected) if expected != actual => Err(ApiError::StaleWrite {
                sheet_id: self.sheet.id,
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    async fn absorb(&mut self, written: RowWrite) -> Result<(), ApiError> {
        match written.version {
            Some(version) => {
                self.sheet.apply_rows(&written.rows);
                self.sheet.version = Some(version);
            }
            // A version read after the write may already cover another writer's edit.
            None => self.refresh().await?,
        }
        Ok(())
    }

    async fn execute(&mut self, plan: &UpsertPlan) -> Result<RecordOutcome, ApiError> {
        match plan {
            UpsertPlan::Noop { row_id } => Ok(RecordOutcome::Unchanged { row_id: *row_id }),
            UpsertPlan::Insert { position, row } => {
                self.ensure_current().await?;
                let mut written = self
                    .api
                    .insert_rows(self.sheet.id, std::slice::from_ref(row), *position)
                    .await?;
                if let Some(created) = written.rows.first_mut().filter(|r| r.cells.is_empty()) {
                    created.cells = row
                        .cells
                        .iter()
                        .map(|patch| Cell {
                            column_id: patch.column_id,
                            value: Some(patch.value.clone()),
                            display_value: None,
                        })
                        .collect();
                }
                let row_id = written.rows.first().map(|r| r.id);
                self.absorb(written).await?;
                Ok(RecordOutcome::Inserted { row_id })
            }
            UpsertPlan::Update(patch) => {
                self.ensure_current().await?;
                let written = self
                    .api
                    .update_rows(self.sheet.id, std::slice::from_ref(patch))
                    .await?;
                self.absorb(written).await?;
                Ok(RecordOutcome::Updated {
                    row_id: patch.id,
                    cells: patch.cells.len(),
                })
            }
        }
    }

    /// Plan and apply one record.
    pub async fn upsert(&mut self, record: &SyncRecord) -> Result<AppliedRecord, SyncError> {
        let mut replanned = false;
        loop {
            let planned = plan_upsert(&self.mapping, &self.columns, &self.sheet, record)?;
            match self.execute(&planned.plan).await {
                Ok(outcome) => {
                    info!(key = %record.key, ?outcome, "record applied");
                    return Ok(AppliedRecord {
                        key: record.key.to_string(),
                        outcome,
                        skipped_fields: planned.skipped_fields,
                        warning: planned.warning,
                    });
                }
                Err(ApiError::StaleWrite { expected, actual, .. }) if !replanned => {
                    warn!(key = %record.key, expected, actual, "sheet changed upstream; refetching and replanning");
                    replanned = true;
                    self.refresh().await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Apply records in order. Record-level failures are collected; transport
    /// and auth failures abort the run.
    pub async fn upsert_batch(&mut self, records: &[SyncRecord]) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::start(&self.mapping.name, self.sheet.id);
        if let Ok(key_column) = self.key_column() {
            report.warnings = find_duplicate_keys(&self.sheet, key_column);
            for warning in &report.warnings {
                warn!(%warning, "duplicate business key on sheet");
            }
        }

        for record in records {
            match self.upsert(record).await {
                Ok(applied) => report.push(applied),
                Err(err) if err.is_record_scoped() => {
                    error!(key = %record.key, error = %err, "record not applied");
                    report.failures.push(RecordFailure {
                        key: record.key.to_string(),
                        error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            failures = report.failures.len(),
            "batch finished"
        );
        Ok(report)
    }

    /// Insert the next `MAJOR.MINOR.N` row under `parent`.
    pub async fn add_subtask(
        &mut self,
        parent: &BusinessKey,
        fields: BTreeMap<String, CellValue>,
    ) -> Result<(TaskKey, AppliedRecord), SyncError> {
        let invalid = || PlanError::InvalidParent(parent.to_string());
        let parent_key = parent
            .as_task()
            .copied()
            .filter(|key| key.sub_minor.is_none())
            .ok_or_else(invalid)?;
        let key_column = self.key_column()?;
        let child = next_subtask_key(&self.sheet, key_column, &parent_key).ok_or_else(invalid)?;
        let record = SyncRecord {
            key: child.into(),
            fields,
            after: None,
            parent: Some(parent.clone()),
        };
        let applied = self.upsert(&record).await?;
        Ok((child, applied))
    }

    /// Remove the rows holding `keys`. Keys held by several rows are left alone
    /// and reported; use [`Self::delete_rows`] for those.
    pub async fn delete_by_keys(&mut self, keys: &[BusinessKey]) -> Result<DeleteReport, SyncError> {
        let mut replanned = false;
        loop {
            let key_column = self.key_column()?;
            let mut report = DeleteReport::default();
            let mut row_ids = Vec::new();
            for key in keys {
                let lookup = find_row_by_key(&self.sheet, key_column, key);
                match (lookup.row.map(|r| r.id), lookup.duplicate) {
                    (_, Some(duplicate)) => {
                        warn!(%duplicate, "not deleting a duplicated key");
                        report.conflicts.push(duplicate);
                    }
                    (Some(row_id), None) => row_ids.push(row_id),
                    (None, None) => report.missing.push(key.to_string()),
                }
            }

            match self.delete_rows(&row_ids).await {
                Ok(deleted) => {
                    report.deleted = deleted;
                    return Ok(report);
                }
                Err(SyncError::Api(ApiError::StaleWrite { expected, actual, .. })) if !replanned => {
                    warn!(expected, actual, "sheet changed upstream; refetching before delete");
                    replanned = true;
                    self.refresh().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn delete_rows(&mut self, row_ids: &[RowId]) -> Result<Vec<RowId>, SyncError> {
        if row_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_current().await?;
        let deleted = self.api.delete_rows(self.sheet.id, row_ids).await?;
        info!(rows = ?deleted, "rows deleted");
        // Child rows go with their parent upstream; refetch rather than mirror that.
        self.refresh().await?;
        Ok(deleted)
    }

    /// Fresh scan for keys held by more than one row.
    pub async fn audit_keys(&mut self) -> Result<Vec<DuplicateKeyWarning>, SyncError> {
        self.refresh().await?;
        let key_column = self.key_column()?;
        Ok(find_duplicate_keys(&self.sheet, key_column))
    }

    /// Upload each manifest file to the row holding its key. Files already
    /// attached under the same name are skipped.
    pub async fn attach_manifest(
        &self,
        manifest: &DeliverableManifest,
        root: &Path,
    ) -> Result<Vec<AttachReport>, SyncError> {
        let key_column = self.key_column()?;
        let mut reports = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let file_name = entry
                .file_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_else(|| entry.file_path.display().to_string());
            let lookup = find_row_by_key(&self.sheet, key_column, &entry.task_key);
            let outcome = match (lookup.row.map(|r| r.id), lookup.duplicate) {
                (_, Some(duplicate)) => {
                    warn!(%duplicate, file = %file_name, "not attaching to a duplicated key");
                    AttachOutcome::DuplicateKey {
                        row_ids: duplicate.row_ids,
                    }
                }
                (None, None) => {
                    warn!(key = %entry.task_key, file = %file_name, "no row for deliverable");
                    AttachOutcome::RowMissing
                }
                (Some(row_id), None) => {
                    self.attach_one(row_id, &root.join(&entry.file_path), &file_name, &entry.sha256)
                        .await?
                }
            };
            reports.push(AttachReport {
                key: entry.task_key.to_string(),
                file: file_name,
                outcome,
            });
        }
        Ok(reports)
    }

    async fn attach_one(
        &self,
        row_id: RowId,
        path: &Path,
        file_name: &str,
        expected_sha256: &str,
    ) -> Result<AttachOutcome, SyncError> {
        let existing = self.api.list_attachments(self.sheet.id, row_id).await?;
        if existing.iter().any(|a| a.name == file_name) {
            info!(row_id, file = %file_name, "already attached");
            return Ok(AttachOutcome::AlreadyAttached { row_id });
        }

        let bytes = fs::read(path).await.map_err(|source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if DeliverableStore::sha256_hex(&bytes) != expected_sha256 {
            warn!(file = %path.display(), "deliverable changed since the manifest was written");
        }

        match self
            .api
            .upload_attachment(self.sheet.id, row_id, bytes, file_name)
            .await
        {
            Ok(attachment) => {
                info!(row_id, file = %file_name, attachment_id = attachment.id, "attachment uploaded");
                Ok(AttachOutcome::Uploaded {
                    row_id,
                    attachment_id: attachment.id,
                })
            }
            Err(ApiError::Conflict { .. }) => Ok(AttachOutcome::AlreadyAttached { row_id }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write `sync_report.json` and a markdown brief under `<reports_dir>/<runId>/`.
pub async fn write_sync_report(reports_dir: &Path, report: &SyncReport) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json_path = run_dir.join(SYNC_REPORT_FILE_NAME);
    fs::write(&json_path, serde_json::to_vec_pretty(report)?)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;
    fs::write(run_dir.join("sync_brief.md"), report.brief_markdown())
        .await
        .with_context(|| format!("writing brief in {}", run_dir.display()))?;
    Ok(json_path)
}
