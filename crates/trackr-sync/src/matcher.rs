use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use trackr_core::{BusinessKey, CellValue, ColumnId, Row, RowId, RowPosition, Sheet, TaskKey};

/// More than one row carries the same business key.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("business key `{key}` matches {} rows: {row_ids:?}", .row_ids.len())]
pub struct DuplicateKeyWarning {
    pub key: String,
    pub row_ids: Vec<RowId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowLookup<'a> {
    /// First match in sheet order.
    pub row: Option<&'a Row>,
    pub duplicate: Option<DuplicateKeyWarning>,
}

/// The business key a stored key cell denotes, if any.
pub fn key_of(value: &CellValue) -> Option<BusinessKey> {
    match value {
        CellValue::Number(n) => TaskKey::from_f64(*n).ok().map(BusinessKey::Task),
        CellValue::Text(s) if !s.trim().is_empty() => Some(BusinessKey::parse(s)),
        _ => None,
    }
}

pub fn find_row_by_key<'a>(sheet: &'a Sheet, key_column: ColumnId, key: &BusinessKey) -> RowLookup<'a> {
    let hits: Vec<&Row> = sheet
        .rows
        .iter()
        .filter(|row| row.value(key_column).is_some_and(|v| key.matches(v)))
        .collect();
    let duplicate = (hits.len() > 1).then(|| DuplicateKeyWarning {
        key: key.to_string(),
        row_ids: hits.iter().map(|r| r.id).collect(),
    });
    RowLookup {
        row: hits.first().copied(),
        duplicate,
    }
}

/// Where a new row goes: right after `predecessor` when it exists, otherwise
/// at the bottom.
pub fn find_insert_position(sheet: &Sheet, key_column: ColumnId, predecessor: Option<&BusinessKey>) -> RowPosition {
    predecessor
        .and_then(|key| find_row_by_key(sheet, key_column, key).row)
        .map(|row| RowPosition::AfterSibling(row.id))
        .unwrap_or_default()
}

/// Every business key held by more than one row, in key order.
pub fn find_duplicate_keys(sheet: &Sheet, key_column: ColumnId) -> Vec<DuplicateKeyWarning> {
    let mut by_key: BTreeMap<BusinessKey, Vec<RowId>> = BTreeMap::new();
    for row in &sheet.rows {
        if let Some(key) = row.value(key_column).and_then(key_of) {
            by_key.entry(key).or_default().push(row.id);
        }
    }
    by_key
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(key, row_ids)| DuplicateKeyWarning {
            key: key.to_string(),
            row_ids,
        })
        .collect()
}

/// Next free `MAJOR.MINOR.N` under `parent`. `None` when `parent` is itself a
/// sub-task.
pub fn next_subtask_key(sheet: &Sheet, key_column: ColumnId, parent: &TaskKey) -> Option<TaskKey> {
    if parent.sub_minor.is_some() {
        return None;
    }
    let highest = sheet
        .rows
        .iter()
        .filter_map(|row| row.value(key_column).and_then(key_of))
        .filter_map(|key| key.as_task().copied())
        .filter(|key| key.parent().as_ref() == Some(parent))
        .filter_map(|key| key.sub_minor)
        .max()
        .unwrap_or(0);
    Some(parent.child(highest + 1))
}
