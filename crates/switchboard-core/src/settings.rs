//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)
//!
//! Only the keys the orchestration core reads are modeled here; every
//! other key in the file is ignored by this crate and passed through
//! untouched to the collaborators that own it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::SettingsError;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// State directory holding persisted registries and transcripts.
    pub state_dir: Option<String>,
    /// Session aliases.
    pub session: SessionSettings,
    /// Agent defaults and per-agent overrides.
    pub agents: AgentsSettings,
    /// Tool access policy.
    pub tools: ToolsSettings,
    /// Model catalog with cost tables.
    pub models: ModelsSettings,
}

/// Session-level settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// The key the `main` alias resolves to.
    pub main_key: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            main_key: "main".into(),
        }
    }
}

/// Agent defaults and the per-agent list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsSettings {
    /// Defaults applied to every agent.
    pub defaults: AgentDefaults,
    /// Per-agent entries; an entry overrides the defaults for its id.
    pub list: Vec<AgentEntry>,
}

/// Defaults shared by all agents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Subagent spawn defaults.
    pub subagents: SubagentDefaults,
}

/// Defaults for spawned subagents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentDefaults {
    /// Default model for child runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Default thinking level for child runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Concurrency cap of the global `subagent` lane.
    pub max_concurrent: usize,
    /// Minutes after which finished child sessions are archived.
    /// `None` disables archival.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_after_minutes: Option<u64>,
}

impl Default for SubagentDefaults {
    fn default() -> Self {
        Self {
            model: None,
            thinking: None,
            max_concurrent: 8,
            archive_after_minutes: Some(60),
        }
    }
}

/// One configured agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentEntry {
    /// Agent id as used in session keys.
    pub id: String,
    /// Subagent overrides for this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagents: Option<AgentSubagentOverrides>,
}

/// Per-agent subagent overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSubagentOverrides {
    /// Model override for children spawned by this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thinking override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Agents this agent may spawn; `None` allows any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_agents: Option<Vec<String>>,
}

/// Tool policy settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsSettings {
    /// Policy applied inside subagent sessions.
    pub subagents: SubagentToolsSettings,
}

/// Tool policy container for subagents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentToolsSettings {
    /// Allow / deny lists; deny dominates.
    pub tools: ToolPolicyConfig,
}

/// Allow / deny lists for tool access.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolPolicyConfig {
    /// When non-empty, access becomes an allow-list.
    pub allow: Vec<String>,
    /// Always denied, overriding `allow`.
    pub deny: Vec<String>,
}

/// Model catalog.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsSettings {
    /// Providers keyed by name.
    pub providers: HashMap<String, ProviderSettings>,
}

/// One provider's model list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Models this provider serves.
    pub models: Vec<ModelEntry>,
}

/// One model with its cost table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelEntry {
    /// Model id.
    pub id: String,
    /// USD per million tokens; absent when unpriced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<ModelCost>,
}

/// USD rates per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelCost {
    /// Prompt-side rate.
    pub input: f64,
    /// Completion-side rate.
    pub output: f64,
}

impl Settings {
    /// Resolved state directory (`~/.switchboard` unless configured).
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".switchboard")
            }
        }
    }

    /// Path of the persisted subagent registry.
    #[must_use]
    pub fn subagent_runs_path(&self) -> PathBuf {
        self.state_dir().join("subagents").join("runs.json")
    }

    /// Look up a model's cost table across all providers.
    #[must_use]
    pub fn model_cost(&self, model: &str) -> Option<ModelCost> {
        self.models
            .providers
            .values()
            .flat_map(|p| p.models.iter())
            .find(|m| m.id == model)
            .and_then(|m| m.cost)
    }

    /// Whether any provider serves the given model id.
    #[must_use]
    pub fn is_known_model(&self, model: &str) -> bool {
        self.models
            .providers
            .values()
            .flat_map(|p| p.models.iter())
            .any(|m| m.id == model)
    }

    /// Per-agent subagent overrides, if configured.
    #[must_use]
    pub fn agent_subagents(&self, agent_id: &str) -> Option<&AgentSubagentOverrides> {
        self.agents
            .list
            .iter()
            .find(|a| a.id == agent_id)
            .and_then(|a| a.subagents.as_ref())
    }

    /// Archive TTL in milliseconds, `None` when archival is disabled.
    #[must_use]
    pub fn subagent_archive_after_ms(&self) -> Option<i64> {
        self.agents
            .defaults
            .subagents
            .archive_after_minutes
            .map(|m| (m as i64).saturating_mul(60_000))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve the default settings file path (`~/.switchboard/settings.json`).
#[must_use]
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules; invalid values are silently
/// ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("SWITCHBOARD_STATE_DIR") {
        settings.state_dir = Some(v);
    }
    if let Some(v) = read_env_string("SWITCHBOARD_MAIN_KEY") {
        settings.session.main_key = v;
    }
    if let Some(v) = read_env_string("SWITCHBOARD_SUBAGENT_MODEL") {
        settings.agents.defaults.subagents.model = Some(v);
    }
    if let Some(v) = read_env_usize("SWITCHBOARD_SUBAGENT_MAX_CONCURRENT", 1, 64) {
        settings.agents.defaults.subagents.max_concurrent = v;
    }
    if let Some(v) = read_env_u64("SWITCHBOARD_SUBAGENT_ARCHIVE_MINUTES", 1, 10_080) {
        settings.agents.defaults.subagents.archive_after_minutes = Some(v);
    }
}

fn read_env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let parsed: usize = std::env::var(name).ok()?.trim().parse().ok()?;
    (min..=max).contains(&parsed).then_some(parsed)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let parsed: u64 = std::env::var(name).ok()?.trim().parse().ok()?;
    (min..=max).contains(&parsed).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.session.main_key, "main");
        assert_eq!(settings.agents.defaults.subagents.max_concurrent, 8);
        assert_eq!(
            settings.agents.defaults.subagents.archive_after_minutes,
            Some(60)
        );
        assert_eq!(settings.subagent_archive_after_ms(), Some(3_600_000));
    }

    #[test]
    fn deep_merge_objects_recursively_and_replaces_arrays() {
        let target = json!({
            "a": {"x": 1, "y": 2},
            "list": [1, 2, 3],
            "keep": "yes"
        });
        let source = json!({
            "a": {"y": 9},
            "list": [7],
            "gone": null
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"]["x"], 1);
        assert_eq!(merged["a"]["y"], 9);
        assert_eq!(merged["list"], json!([7]));
        assert_eq!(merged["keep"], "yes");
        assert!(merged.get("gone").is_none());
    }

    #[test]
    fn load_from_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            json!({
                "agents": {"defaults": {"subagents": {"maxConcurrent": 3, "model": "small-1"}}},
                "models": {"providers": {"acme": {"models": [
                    {"id": "small-1", "cost": {"input": 1.0, "output": 5.0}}
                ]}}}
            })
            .to_string(),
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.agents.defaults.subagents.max_concurrent, 3);
        assert_eq!(
            settings.agents.defaults.subagents.model.as_deref(),
            Some("small-1")
        );
        // untouched defaults survive the merge
        assert_eq!(
            settings.agents.defaults.subagents.archive_after_minutes,
            Some(60)
        );
        assert!(settings.is_known_model("small-1"));
        let cost = settings.model_cost("small-1").unwrap();
        assert_eq!(cost.input, 1.0);
        assert_eq!(cost.output, 5.0);
        assert!(settings.model_cost("other").is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, {
            let mut s = Settings::default();
            apply_env_overrides(&mut s);
            s
        });
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        std::env::set_var("SWITCHBOARD_SUBAGENT_MAX_CONCURRENT", "not-a-number");
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings);
        assert_eq!(settings.agents.defaults.subagents.max_concurrent, 8);
        std::env::remove_var("SWITCHBOARD_SUBAGENT_MAX_CONCURRENT");
    }

    #[test]
    fn agent_overrides_resolve_by_id() {
        let mut settings = Settings::default();
        settings.agents.list.push(AgentEntry {
            id: "helper".into(),
            subagents: Some(AgentSubagentOverrides {
                model: Some("big-1".into()),
                allow_agents: Some(vec!["scout".into()]),
                ..Default::default()
            }),
        });
        let overrides = settings.agent_subagents("helper").unwrap();
        assert_eq!(overrides.model.as_deref(), Some("big-1"));
        assert!(settings.agent_subagents("other").is_none());
    }

    #[test]
    fn runs_path_lives_under_state_dir() {
        let settings = Settings {
            state_dir: Some("/var/lib/switchboard".into()),
            ..Default::default()
        };
        assert_eq!(
            settings.subagent_runs_path(),
            PathBuf::from("/var/lib/switchboard/subagents/runs.json")
        );
    }
}
