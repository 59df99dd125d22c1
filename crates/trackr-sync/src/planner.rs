//! Turns one desired record into the minimal write against a sheet snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use trackr_core::{BusinessKey, CellPatch, CellValue, ColumnId, NewRow, RowId, RowPatch, RowPosition, Sheet};

use crate::columns::{ColumnMap, FieldSpec, ResolveError};
use crate::matcher::{find_insert_position, find_row_by_key, DuplicateKeyWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Refuse to write a key held by more than one row.
    #[default]
    Abort,
    /// Write to the first row in sheet order and report the duplicate.
    UseFirst,
}

/// Named mapping from logical fields to sheet columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub key: FieldSpec,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
}

impl SyncMapping {
    /// Key plus fields; the key is always required.
    pub fn field_specs(&self) -> Vec<FieldSpec> {
        let mut specs = Vec::with_capacity(self.fields.len() + 1);
        specs.push(FieldSpec {
            required: true,
            ..self.key.clone()
        });
        specs.extend(self.fields.iter().cloned());
        specs
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// Desired state of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub key: BusinessKey,
    #[serde(default)]
    pub fields: BTreeMap<String, CellValue>,
    /// Business key of the row a new row should follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<BusinessKey>,
    /// Business key of the row a new row should nest under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<BusinessKey>,
}

impl SyncRecord {
    pub fn new(key: BusinessKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
            after: None,
            parent: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    fn value_for(&self, spec: &FieldSpec) -> Option<&CellValue> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&spec.name))
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("required field `{name}` cannot be written: {reason}")]
    MissingRequiredColumn { name: String, reason: String },
    #[error("field `{name}` is not part of preset `{preset}`")]
    UnknownField { name: String, preset: String },
    #[error(transparent)]
    Conflict(#[from] DuplicateKeyWarning),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("parent row `{0}` not found")]
    ParentNotFound(String),
    #[error("`{0}` cannot take sub-tasks")]
    InvalidParent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertPlan {
    Insert { position: RowPosition, row: NewRow },
    Update(RowPatch),
    Noop { row_id: RowId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpsert {
    pub plan: UpsertPlan,
    pub warning: Option<DuplicateKeyWarning>,
    /// Optional fields dropped because their column is not on the sheet.
    pub skipped_fields: Vec<String>,
}

/// Decide insert, update or no-op for `record`.
///
/// Updates carry only the cells whose stored value differs from the desired
/// one, so unrelated columns are never touched.
pub fn plan_upsert(
    mapping: &SyncMapping,
    columns: &ColumnMap,
    sheet: &Sheet,
    record: &SyncRecord,
) -> Result<PlannedUpsert, PlanError> {
    if let Some(name) = record.fields.keys().find(|name| mapping.field(name).is_none()) {
        return Err(PlanError::UnknownField {
            name: name.clone(),
            preset: mapping.name.clone(),
        });
    }

    let key_column = columns.require(&mapping.key.name)?;
    let lookup = find_row_by_key(sheet, key_column, &record.key);
    let mut warning = None;
    if let Some(duplicate) = lookup.duplicate {
        match mapping.on_duplicate {
            DuplicatePolicy::Abort => return Err(PlanError::Conflict(duplicate)),
            DuplicatePolicy::UseFirst => {
                warn!(key = %record.key, rows = ?duplicate.row_ids, "duplicate key; writing first row");
                warning = Some(duplicate);
            }
        }
    }

    let mut skipped_fields = Vec::new();
    let mut desired = Vec::new();
    for spec in &mapping.fields {
        let Some(value) = record.value_for(spec) else {
            continue;
        };
        match columns.require(&spec.name) {
            Ok(column_id) => desired.push(CellPatch {
                column_id,
                value: value.clone(),
            }),
            Err(err) if spec.required => {
                return Err(PlanError::MissingRequiredColumn {
                    name: spec.name.clone(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                warn!(key = %record.key, field = %spec.name, error = %err, "skipping field without a column");
                skipped_fields.push(spec.name.clone());
            }
        }
    }

    let plan = match lookup.row {
        Some(row) => {
            let changed: Vec<CellPatch> = desired
                .into_iter()
                .filter(|patch| !row.value(patch.column_id).is_some_and(|v| v.same_as(&patch.value)))
                .collect();
            if changed.is_empty() {
                UpsertPlan::Noop { row_id: row.id }
            } else {
                UpsertPlan::Update(RowPatch {
                    id: row.id,
                    cells: changed,
                })
            }
        }
        None => {
            for spec in mapping.fields.iter().filter(|s| s.required) {
                if record.value_for(spec).is_none() {
                    return Err(PlanError::MissingRequiredColumn {
                        name: spec.name.clone(),
                        reason: "no value supplied for a new row".to_string(),
                    });
                }
            }
            let mut cells = vec![CellPatch {
                column_id: key_column,
                value: record.key.to_cell_value(),
            }];
            cells.extend(desired);
            UpsertPlan::Insert {
                position: insert_position(sheet, key_column, record)?,
                row: NewRow { cells },
            }
        }
    };

    Ok(PlannedUpsert {
        plan,
        warning,
        skipped_fields,
    })
}

fn insert_position(sheet: &Sheet, key_column: ColumnId, record: &SyncRecord) -> Result<RowPosition, PlanError> {
    if let Some(parent) = &record.parent {
        let row = find_row_by_key(sheet, key_column, parent)
            .row
            .ok_or_else(|| PlanError::ParentNotFound(parent.to_string()))?;
        return Ok(RowPosition::ChildOf(row.id));
    }
    Ok(find_insert_position(sheet, key_column, record.after.as_ref()))
}
