//! Logical field name → column id resolution.
//!
//! Titles drift as people edit the sheet, so each field carries hints. Lookup
//! order: exact title, case-insensitive equality with the name or a hint,
//! then substring match per hint. More than one hit at any stage is an error
//! rather than a guess.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::warn;
use trackr_core::{Column, ColumnId, Sheet};

const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hints: Vec::new(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hints = hints.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no column matches `{name}`{}", suggestion_suffix(.suggestion))]
    ColumnNotFound { name: String, suggestion: Option<String> },
    #[error("`{name}` is ambiguous between columns {candidates:?}")]
    AmbiguousColumn { name: String, candidates: Vec<String> },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (closest title: `{s}`)"))
        .unwrap_or_default()
}

/// Resolution result for a set of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    resolved: BTreeMap<String, ColumnId>,
    failures: BTreeMap<String, ResolveError>,
}

impl ColumnMap {
    pub fn get(&self, name: &str) -> Option<ColumnId> {
        self.resolved.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<ColumnId, ResolveError> {
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        Err(self
            .failures
            .get(name)
            .cloned()
            .unwrap_or_else(|| ResolveError::ColumnNotFound {
                name: name.to_string(),
                suggestion: None,
            }))
    }

    pub fn failure(&self, name: &str) -> Option<&ResolveError> {
        self.failures.get(name)
    }

    pub fn resolved(&self) -> impl Iterator<Item = (&str, ColumnId)> {
        self.resolved.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn unresolved(&self) -> impl Iterator<Item = (&str, &ResolveError)> {
        self.failures.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Resolve one field against the sheet's columns.
pub fn resolve_field(sheet: &Sheet, spec: &FieldSpec) -> Result<ColumnId, ResolveError> {
    let exact: Vec<&Column> = sheet.columns.iter().filter(|c| c.title == spec.name).collect();
    if let Some(id) = single(spec, &exact)? {
        return Ok(id);
    }

    let needles: Vec<String> = std::iter::once(&spec.name)
        .chain(spec.hints.iter())
        .map(|s| normalize(s))
        .filter(|s| !s.is_empty())
        .collect();

    for needle in &needles {
        let folded: Vec<&Column> = sheet
            .columns
            .iter()
            .filter(|c| normalize(&c.title) == *needle)
            .collect();
        if let Some(id) = single(spec, &folded)? {
            return Ok(id);
        }
    }

    for needle in &needles {
        let partial: Vec<&Column> = sheet
            .columns
            .iter()
            .filter(|c| normalize(&c.title).contains(needle.as_str()))
            .collect();
        if let Some(id) = single(spec, &partial)? {
            return Ok(id);
        }
    }

    Err(ResolveError::ColumnNotFound {
        name: spec.name.clone(),
        suggestion: closest_title(sheet, spec),
    })
}

/// Resolve every field; the first required field that fails aborts.
pub fn resolve_columns(sheet: &Sheet, specs: &[FieldSpec]) -> Result<ColumnMap, ResolveError> {
    let map = resolve_columns_lenient(sheet, specs);
    for spec in specs.iter().filter(|s| s.required) {
        map.require(&spec.name)?;
    }
    Ok(map)
}

/// Resolve every field, recording failures instead of returning them.
pub fn resolve_columns_lenient(sheet: &Sheet, specs: &[FieldSpec]) -> ColumnMap {
    let mut map = ColumnMap::default();
    for spec in specs {
        match resolve_field(sheet, spec) {
            Ok(id) => {
                map.resolved.insert(spec.name.clone(), id);
            }
            Err(err) => {
                if !spec.required {
                    warn!(field = %spec.name, error = %err, "optional column unresolved");
                }
                map.failures.insert(spec.name.clone(), err);
            }
        }
    }
    map
}

fn single(spec: &FieldSpec, hits: &[&Column]) -> Result<Option<ColumnId>, ResolveError> {
    match hits {
        [] => Ok(None),
        [only] => Ok(Some(only.id)),
        many => Err(ResolveError::AmbiguousColumn {
            name: spec.name.clone(),
            candidates: many.iter().map(|c| c.title.clone()).collect(),
        }),
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

fn closest_title(sheet: &Sheet, spec: &FieldSpec) -> Option<String> {
    let target = normalize(&spec.name);
    sheet
        .columns
        .iter()
        .map(|c| (jaro_winkler(&target, &normalize(&c.title)), c))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c.title.clone())
}
