use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::planner::SyncMapping;

const BUILTIN_PRESETS: &str = include_str!("../config/presets.yaml");

pub const DEFAULT_PRESET: &str = "task-tracker";

#[derive(Debug, Clone, Deserialize)]
pub struct PresetRegistry {
    pub presets: Vec<SyncMapping>,
}

impl PresetRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_PRESETS).context("parsing built-in presets")
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(raw)?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&SyncMapping> {
        self.presets.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.iter().map(|p| p.name.as_str())
    }

    fn validate(&self) -> Result<()> {
        for (i, preset) in self.presets.iter().enumerate() {
            if self.presets[..i].iter().any(|p| p.name == preset.name) {
                bail!("preset `{}` is defined twice", preset.name);
            }
            for field in &preset.fields {
                if field.name.eq_ignore_ascii_case(&preset.key.name) {
                    bail!("preset `{}` lists its key `{}` as a field", preset.name, field.name);
                }
            }
            if let Some(dup) = preset
                .fields
                .iter()
                .enumerate()
                .find(|(j, f)| preset.fields[..*j].iter().any(|g| g.name.eq_ignore_ascii_case(&f.name)))
            {
                bail!("preset `{}` lists field `{}` twice", preset.name, dup.1.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DuplicatePolicy;

    #[test]
    fn builtin_presets_parse() {
        let registry = PresetRegistry::builtin().expect("builtin");
        let tracker = registry.get(DEFAULT_PRESET).expect("task tracker");
        assert_eq!(tracker.key.name, "Task ID");
        assert_eq!(tracker.key.hints, vec!["task id", "task #", "task number"]);
        assert_eq!(tracker.on_duplicate, DuplicatePolicy::Abort);
        assert!(tracker.field("sdlc phase").is_some());
        assert!(registry.names().any(|n| n == "security-audit"));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let raw = r#"
presets:
  - name: a
    key: { name: ID }
    fields:
      - name: Title
      - name: title
"#;
        assert!(PresetRegistry::from_yaml_str(raw).is_err());

        let raw = r#"
presets:
  - name: a
    key: { name: ID }
    fields: [{ name: id }]
"#;
        assert!(PresetRegistry::from_yaml_str(raw).is_err());
    }

    #[test]
    fn duplicate_policy_is_configurable() {
        let raw = r#"
presets:
  - name: loose
    key: { name: ID }
    on_duplicate: use_first
"#;
        let registry = PresetRegistry::from_yaml_str(raw).unwrap();
        assert_eq!(registry.presets[0].on_duplicate, DuplicatePolicy::UseFirst);
    }
}
