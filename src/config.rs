use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::detector::DetectorRegistry;
use crate::findings::Priority;

/// Rule configuration file as written by users.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub(crate) rules: BTreeMap<String, RuleSetting>,
    #[serde(default)]
    pub(crate) min_priority: Option<Priority>,
}

/// Per-pattern override.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuleSetting {
    #[serde(default)]
    pub(crate) enabled: Option<bool>,
    #[serde(default)]
    pub(crate) priority: Option<Priority>,
}

fn config_schema() -> Value {
    let priority = json!({ "type": "string", "enum": ["high", "normal", "low"] });
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "min_priority": priority,
            "rules": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "enabled": { "type": "boolean" },
                        "priority": priority
                    }
                }
            }
        }
    })
}

/// Validate `value` against the embedded schema, then deserialize it.
pub(crate) fn parse_config(value: &Value) -> Result<ConfigFile> {
    let schema = config_schema();
    let compiled =
        JSONSchema::compile(&schema).map_err(|error| anyhow!("invalid config schema: {error}"))?;
    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors
            .map(|error| format!("{}: {error}", error.instance_path))
            .collect();
        anyhow::bail!("config does not match schema: {}", messages.join("; "));
    }
    serde_json::from_value(value.clone()).context("failed to deserialize config")
}

pub(crate) fn load_config(path: &Path) -> Result<ConfigFile> {
    let data =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    parse_config(&value).with_context(|| format!("invalid config {}", path.display()))
}

/// Enable/disable and priority overrides keyed by pattern id.
#[derive(Clone, Debug, Default)]
pub(crate) struct RulePolicy {
    disabled: Vec<String>,
    priorities: BTreeMap<String, Priority>,
    min_priority: Option<Priority>,
}

impl RulePolicy {
    /// Build a policy, rejecting ids no registered detector reports.
    pub(crate) fn from_config(config: &ConfigFile, registry: &DetectorRegistry) -> Result<Self> {
        let mut policy = Self {
            min_priority: config.min_priority,
            ..Self::default()
        };
        for (id, setting) in &config.rules {
            if registry.pattern(id).is_none() {
                anyhow::bail!("unknown pattern id in config: {id}");
            }
            if setting.enabled == Some(false) {
                policy.disabled.push(id.clone());
            }
            if let Some(priority) = setting.priority {
                policy.priorities.insert(id.clone(), priority);
            }
        }
        Ok(policy)
    }

    pub(crate) fn is_enabled(&self, pattern_id: &str) -> bool {
        !self.disabled.iter().any(|id| id == pattern_id)
    }

    pub(crate) fn priority_for(&self, pattern_id: &str, default: Priority) -> Priority {
        self.priorities.get(pattern_id).copied().unwrap_or(default)
    }

    pub(crate) fn min_priority(&self) -> Option<Priority> {
        self.min_priority
    }
}
