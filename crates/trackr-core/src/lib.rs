//! Core sheet model and business-key types for trackr.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "trackr-core";

pub type SheetId = u64;
pub type ColumnId = u64;
pub type RowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColumnType {
    #[default]
    #[serde(rename = "TEXT_NUMBER")]
    TextNumber,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "PICKLIST")]
    Picklist,
    #[serde(rename = "CONTACT_LIST")]
    ContactList,
    #[serde(rename = "CHECKBOX")]
    Checkbox,
    #[serde(other, rename = "OTHER")]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: ColumnId,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: ColumnType,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub index: u32,
}

/// A cell value as the sheet service stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Interpret operator input: `true`/`false`, plain numbers, anything else as text.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    /// Value equality used for diffing.
    ///
    /// Percent-complete cells show up both as `1.0` and `"100%"`; the two are
    /// treated as the same value so reruns do not flip them back and forth.
    pub fn same_as(&self, other: &CellValue) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-9,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Number(n), Self::Text(t)) | (Self::Text(t), Self::Number(n)) => {
                let as_percent = parse_percent(t).map(|p| (p - n).abs() < 1e-9);
                let as_plain = t.trim().parse::<f64>().ok().map(|p| (p - n).abs() < 1e-9);
                as_percent.or(as_plain).unwrap_or(false)
            }
            _ => false,
        }
    }
}

fn parse_percent(text: &str) -> Option<f64> {
    let number = text.trim().strip_suffix('%')?.trim();
    number.parse::<f64>().ok().map(|p| p / 100.0)
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub column_id: ColumnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CellValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: RowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_id: Option<RowId>,
    #[serde(default)]
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn cell(&self, column_id: ColumnId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.column_id == column_id)
    }

    pub fn value(&self, column_id: ColumnId) -> Option<&CellValue> {
        self.cell(column_id).and_then(|c| c.value.as_ref())
    }

    fn merge_from(&mut self, other: &Row) {
        self.row_number = other.row_number.or(self.row_number);
        self.parent_id = other.parent_id.or(self.parent_id);
        self.sibling_id = other.sibling_id.or(self.sibling_id);
        for cell in &other.cells {
            match self.cells.iter_mut().find(|c| c.column_id == cell.column_id) {
                Some(existing) => *existing = cell.clone(),
                None => self.cells.push(cell.clone()),
            }
        }
    }
}

/// Snapshot of a remote sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    pub id: SheetId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl Sheet {
    pub fn column(&self, id: ColumnId) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }

    /// Fold rows returned by a write back into the snapshot.
    ///
    /// Known rows are merged cell by cell. New rows land after their sibling
    /// when the sibling is present, otherwise at the end.
    pub fn apply_rows(&mut self, rows: &[Row]) {
        for row in rows {
            if let Some(existing) = self.rows.iter_mut().find(|r| r.id == row.id) {
                existing.merge_from(row);
                continue;
            }
            let anchor = row
                .sibling_id
                .and_then(|sibling| self.rows.iter().position(|r| r.id == sibling));
            match anchor {
                Some(index) => self.rows.insert(index + 1, row.clone()),
                None => self.rows.push(row.clone()),
            }
        }
    }

    pub fn remove_rows(&mut self, ids: &[RowId]) {
        self.rows.retain(|r| !ids.contains(&r.id));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_in_kb: Option<u64>,
}

/// Where newly inserted rows land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowPosition {
    Top,
    #[default]
    Bottom,
    AfterSibling(RowId),
    ChildOf(RowId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellPatch {
    pub column_id: ColumnId,
    pub value: CellValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewRow {
    pub cells: Vec<CellPatch>,
}

/// Update for one existing row; cells not listed are left untouched upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPatch {
    pub id: RowId,
    pub cells: Vec<CellPatch>,
}

/// Rows echoed back by an insert or update, plus the sheet version after the write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowWrite {
    pub rows: Vec<Row>,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskKeyError {
    #[error("empty task key")]
    Empty,
    #[error("task key `{0}` is not of the form MAJOR[.MINOR[.SUB]]")]
    Malformed(String),
    #[error("task key `{0}` has more than two fractional digits")]
    TooPrecise(String),
    #[error("numeric task key {0} is out of range")]
    OutOfRange(String),
}

/// Structured task number such as `1.9` or `1.9.2`.
///
/// `minor` holds hundredths so that `1.1` and `1.10` are the same key, which is
/// how the sheet stores them once they pass through a numeric cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct TaskKey {
    pub major: u32,
    pub minor: u32,
    pub sub_minor: Option<u32>,
}

impl TaskKey {
    pub fn new(major: u32, minor: u32, sub_minor: Option<u32>) -> Self {
        Self {
            major,
            minor: minor.min(99),
            sub_minor,
        }
    }

    /// Quantize a numeric cell value to hundredths.
    pub fn from_f64(value: f64) -> Result<Self, TaskKeyError> {
        if !value.is_finite() || value < 0.0 {
            return Err(TaskKeyError::OutOfRange(value.to_string()));
        }
        let hundredths = (value * 100.0).round();
        if hundredths > (u32::MAX as f64) * 100.0 {
            return Err(TaskKeyError::OutOfRange(value.to_string()));
        }
        let hundredths = hundredths as u64;
        Ok(Self {
            major: (hundredths / 100) as u32,
            minor: (hundredths % 100) as u32,
            sub_minor: None,
        })
    }

    pub fn as_f64(&self) -> f64 {
        self.major as f64 + self.minor as f64 / 100.0
    }

    /// A numeric cell matches when it quantizes to the same hundredth.
    pub fn matches_number(&self, value: f64) -> bool {
        self.sub_minor.is_none() && TaskKey::from_f64(value).is_ok_and(|k| k == *self)
    }

    /// The `MAJOR.MINOR` key a sub-task hangs off.
    pub fn parent(&self) -> Option<TaskKey> {
        self.sub_minor.map(|_| TaskKey {
            sub_minor: None,
            ..*self
        })
    }

    pub fn child(&self, sub_minor: u32) -> TaskKey {
        TaskKey {
            sub_minor: Some(sub_minor),
            ..*self
        }
    }

    fn minor_digits(&self) -> String {
        if self.minor % 10 == 0 {
            (self.minor / 10).to_string()
        } else {
            format!("{:02}", self.minor)
        }
    }
}

impl FromStr for TaskKey {
    type Err = TaskKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TaskKeyError::Empty);
        }
        let malformed = || TaskKeyError::Malformed(trimmed.to_string());
        let segments: Vec<&str> = trimmed.split('.').collect();
        if segments.len() > 3 || segments.iter().any(|seg| seg.is_empty()) {
            return Err(malformed());
        }
        if segments
            .iter()
            .any(|seg| !seg.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(malformed());
        }

        let major = segments[0].parse::<u32>().map_err(|_| malformed())?;
        let minor = match segments.get(1) {
            None => 0,
            Some(raw) => {
                let digits = raw.trim_end_matches('0');
                match digits.len() {
                    0 => 0,
                    1 => digits.parse::<u32>().map_err(|_| malformed())? * 10,
                    2 => digits.parse::<u32>().map_err(|_| malformed())?,
                    _ => return Err(TaskKeyError::TooPrecise(trimmed.to_string())),
                }
            }
        };
        let sub_minor = match segments.get(2) {
            None => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| malformed())?),
        };
        Ok(Self {
            major,
            minor,
            sub_minor,
        })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_minor {
            None if self.minor == 0 => write!(f, "{}", self.major),
            None => write!(f, "{}.{}", self.major, self.minor_digits()),
            Some(sub) => write!(f, "{}.{}.{}", self.major, self.minor_digits(), sub),
        }
    }
}

impl From<TaskKey> for String {
    fn from(value: TaskKey) -> Self {
        value.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawKey {
    Number(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for TaskKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawKey::deserialize(deserializer)? {
            RawKey::Number(n) => TaskKey::from_f64(n).map_err(serde::de::Error::custom),
            RawKey::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Domain identity of a row, independent of its storage id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub enum BusinessKey {
    Task(TaskKey),
    Text(String),
}

impl BusinessKey {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<TaskKey>() {
            Ok(key) => Self::Task(key),
            Err(_) => Self::Text(raw.trim().to_string()),
        }
    }

    pub fn as_task(&self) -> Option<&TaskKey> {
        match self {
            Self::Task(key) => Some(key),
            Self::Text(_) => None,
        }
    }

    /// Whether a stored cell value denotes this key.
    pub fn matches(&self, value: &CellValue) -> bool {
        match (self, value) {
            (Self::Task(key), CellValue::Number(n)) => key.matches_number(*n),
            (Self::Task(key), CellValue::Text(s)) => s.parse::<TaskKey>().ok() == Some(*key),
            (Self::Text(key), CellValue::Text(s)) => s.trim() == key,
            (Self::Text(key), CellValue::Number(_)) => value.to_string() == *key,
            _ => false,
        }
    }

    /// Representation written into the key column on insert.
    pub fn to_cell_value(&self) -> CellValue {
        match self {
            Self::Task(key) if key.sub_minor.is_none() => CellValue::Number(key.as_f64()),
            Self::Task(key) => CellValue::Text(key.to_string()),
            Self::Text(text) => CellValue::Text(text.clone()),
        }
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(key) => key.fmt(f),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<BusinessKey> for String {
    fn from(value: BusinessKey) -> Self {
        value.to_string()
    }
}

impl From<TaskKey> for BusinessKey {
    fn from(value: TaskKey) -> Self {
        Self::Task(value)
    }
}

impl<'de> Deserialize<'de> for BusinessKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawKey::deserialize(deserializer)? {
            RawKey::Number(n) => TaskKey::from_f64(n)
                .map(BusinessKey::Task)
                .map_err(serde::de::Error::custom),
            RawKey::Text(s) => Ok(BusinessKey::parse(&s)),
        }
    }
}

/// One generated deliverable and the business key it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub task_key: BusinessKey,
    /// Path relative to the manifest's directory.
    pub file_path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub generated_at: DateTime<Utc>,
}

/// Explicit key → file list handed from report generation to attachment upload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeliverableManifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl DeliverableManifest {
    /// Insert the entry, replacing one with the same task key and file path.
    pub fn record(&mut self, entry: ManifestEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.task_key == entry.task_key && e.file_path == entry.file_path)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entries_for<'a>(&'a self, key: &'a BusinessKey) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |e| &e.task_key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_keys_parse_and_normalize_trailing_zeros() {
        let a: TaskKey = "1.10".parse().unwrap();
        let b: TaskKey = "1.1".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "1.1");

        let c: TaskKey = "1.9.2".parse().unwrap();
        assert_eq!(c, TaskKey::new(1, 90, Some(2)));
        assert_eq!(c.to_string(), "1.9.2");
        assert_eq!(c.parent(), Some("1.9".parse().unwrap()));

        assert_eq!("2.05".parse::<TaskKey>().unwrap().to_string(), "2.05");
        assert_eq!("3".parse::<TaskKey>().unwrap().to_string(), "3");
    }

    #[test]
    fn malformed_task_keys_are_rejected() {
        assert_eq!("".parse::<TaskKey>(), Err(TaskKeyError::Empty));
        assert!(matches!("1..2".parse::<TaskKey>(), Err(TaskKeyError::Malformed(_))));
        assert!(matches!("1.a".parse::<TaskKey>(), Err(TaskKeyError::Malformed(_))));
        assert!(matches!("1.2.3.4".parse::<TaskKey>(), Err(TaskKeyError::Malformed(_))));
        assert!(matches!("1.123".parse::<TaskKey>(), Err(TaskKeyError::TooPrecise(_))));
    }

    #[test]
    fn task_keys_order_by_structure() {
        let mut keys: Vec<TaskKey> = ["1.10", "1.9", "1.9.1", "2", "1.11"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(rendered, vec!["1.1", "1.11", "1.9", "1.9.1", "2"]);
    }

    #[test]
    fn numeric_cells_match_within_tolerance() {
        let key = BusinessKey::parse("1.10");
        assert!(key.matches(&CellValue::Number(1.1000000000000001)));
        assert!(!key.matches(&CellValue::Number(1.11)));
        assert!(key.matches(&CellValue::Text("1.1".into())));
        assert_eq!(TaskKey::from_f64(1.0999999999).unwrap().to_string(), "1.1");
    }

    #[test]
    fn adjacent_hundredths_do_not_match() {
        let two = BusinessKey::parse("2");
        assert!(two.matches(&CellValue::Number(2.0)));
        assert!(!two.matches(&CellValue::Number(2.01)));
        assert!(!BusinessKey::parse("2.01").matches(&CellValue::Number(2.0)));
        assert!(!BusinessKey::parse("3").matches(&CellValue::Number(3.01)));
        assert!(!BusinessKey::parse("1.11").matches(&CellValue::Number(1.1)));
        assert!(!BusinessKey::parse("1.9.1").matches(&CellValue::Number(1.9)));
        assert!(matches!(TaskKey::from_f64(-1.0), Err(TaskKeyError::OutOfRange(_))));
    }

    #[test]
    fn percent_and_fraction_compare_equal() {
        assert!(CellValue::Number(1.0).same_as(&CellValue::Text("100%".into())));
        assert!(CellValue::Text("50 %".into()).same_as(&CellValue::Number(0.5)));
        assert!(!CellValue::Number(0.5).same_as(&CellValue::Text("5%".into())));
        assert!(!CellValue::Text("Done".into()).same_as(&CellValue::Bool(true)));
    }

    #[test]
    fn business_keys_deserialize_from_numbers_and_strings() {
        let keys: Vec<BusinessKey> = serde_json::from_str(r#"[1.9, "1.9.2", "ops-setup"]"#).unwrap();
        assert_eq!(keys[0], BusinessKey::Task("1.9".parse().unwrap()));
        assert_eq!(keys[1].to_string(), "1.9.2");
        assert_eq!(keys[2], BusinessKey::Text("ops-setup".into()));
    }

    #[test]
    fn sheet_payload_deserializes_and_applies_writes() {
        let raw = r#"{
            "id": 7, "name": "Tracker", "version": 3,
            "columns": [
                {"id": 11, "title": "Task ID", "type": "TEXT_NUMBER", "primary": true, "index": 0},
                {"id": 12, "title": "Status", "type": "PICKLIST", "index": 1},
                {"id": 13, "title": "Owner", "type": "MULTI_CONTACT_LIST", "index": 2}
            ],
            "rows": [
                {"id": 100, "rowNumber": 1, "cells": [{"columnId": 11, "value": 1.1}, {"columnId": 12, "value": "Open", "displayValue": "Open"}]}
            ]
        }"#;
        let mut sheet: Sheet = serde_json::from_str(raw).unwrap();
        assert_eq!(sheet.columns[2].kind, ColumnType::Other);
        assert_eq!(sheet.rows[0].value(12), Some(&CellValue::Text("Open".into())));

        sheet.apply_rows(&[
            Row {
                id: 100,
                row_number: None,
                parent_id: None,
                sibling_id: None,
                cells: vec![Cell { column_id: 12, value: Some("Done".into()), display_value: None }],
            },
            Row {
                id: 101,
                row_number: None,
                parent_id: None,
                sibling_id: Some(100),
                cells: vec![],
            },
        ]);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].value(12), Some(&CellValue::Text("Done".into())));
        assert_eq!(sheet.rows[0].value(11), Some(&CellValue::Number(1.1)));

        sheet.remove_rows(&[100]);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].id, 101);
    }

    #[test]
    fn manifest_record_replaces_same_key_and_path() {
        let mut manifest = DeliverableManifest::default();
        let entry = ManifestEntry {
            task_key: BusinessKey::parse("1.1"),
            file_path: PathBuf::from("1.1-Tech-Stack.docx"),
            sha256: "aa".into(),
            bytes: 10,
            generated_at: Utc::now(),
        };
        manifest.record(entry.clone());
        manifest.record(ManifestEntry {
            sha256: "bb".into(),
            ..entry.clone()
        });
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].sha256, "bb");
        assert_eq!(manifest.entries_for(&BusinessKey::parse("1.10")).count(), 1);

        manifest.record(ManifestEntry {
            file_path: PathBuf::from("1.1-Tech-Stack-Appendix.docx"),
            ..entry
        });
        assert_eq!(manifest.entries_for(&BusinessKey::parse("1.10")).count(), 2);
        assert_eq!(manifest.entries[0].sha256, "bb");
    }
}
