//! Persisted registry envelope.
//!
//! The registry is stored at `<state_dir>/subagents/runs.json` as a
//! versioned envelope `{version, runs}`. Version 2 is always written.
//! Version 1 payloads are migrated on read (`announceCompletedAt` →
//! `cleanupCompletedAt`, `announceHandled` → `cleanupHandled`, separate
//! `requesterChannel` / `requesterAccountId` fields → `requesterOrigin`).
//! Unknown versions load as an empty registry: no crash, and the file is
//! not overwritten until a migration succeeds in memory.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use switchboard_core::delivery::DeliveryContext;

use crate::errors::PersistError;
use crate::registry::record::SubagentRunRecord;

/// Envelope version this code writes.
pub const REGISTRY_VERSION: u32 = 2;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRegistry {
    #[serde(default)]
    runs: HashMap<String, SubagentRunRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveEnvelope<'a> {
    version: u32,
    runs: &'a HashMap<String, SubagentRunRecord>,
}

/// Result of reading the registry file.
#[derive(Debug, Default)]
pub struct LoadedRegistry {
    /// Restored records, keyed by run id.
    pub runs: HashMap<String, SubagentRunRecord>,
    /// Whether a v1 payload was migrated and should be re-saved.
    pub migrated: bool,
}

/// Read the registry file; failures yield an empty registry.
#[must_use]
pub fn load_registry(path: &Path) -> LoadedRegistry {
    if !path.exists() {
        return LoadedRegistry::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(?path, error = %err, "failed to read subagent registry");
            return LoadedRegistry::default();
        }
    };
    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            warn!(?path, error = %err, "subagent registry is not valid JSON");
            return LoadedRegistry::default();
        }
    };

    match value.get("version").and_then(Value::as_u64) {
        Some(2) => match serde_json::from_value::<PersistedRegistry>(value) {
            Ok(parsed) => LoadedRegistry {
                runs: fill_run_ids(parsed.runs),
                migrated: false,
            },
            Err(err) => {
                warn!(?path, error = %err, "subagent registry v2 payload malformed");
                LoadedRegistry::default()
            }
        },
        Some(1) => LoadedRegistry {
            runs: migrate_v1(value.get("runs")),
            migrated: true,
        },
        other => {
            warn!(?path, version = ?other, "unknown subagent registry version, starting empty");
            LoadedRegistry::default()
        }
    }
}

/// Write the registry as a v2 envelope, creating parent directories.
pub fn save_registry(
    path: &Path,
    runs: &HashMap<String, SubagentRunRecord>,
) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let envelope = SaveEnvelope {
        version: REGISTRY_VERSION,
        runs,
    };
    let payload = serde_json::to_string_pretty(&envelope)?;
    std::fs::write(path, payload)?;
    Ok(())
}

fn fill_run_ids(
    runs: HashMap<String, SubagentRunRecord>,
) -> HashMap<String, SubagentRunRecord> {
    runs.into_iter()
        .map(|(run_id, mut record)| {
            if record.run_id.is_empty() {
                record.run_id = run_id.clone();
            }
            (run_id, record)
        })
        .collect()
}

/// Build v2 records out of a v1 `runs` object. Entries that fail to
/// parse are skipped with a warning rather than poisoning the rest.
fn migrate_v1(runs: Option<&Value>) -> HashMap<String, SubagentRunRecord> {
    let Some(Value::Object(entries)) = runs else {
        return HashMap::new();
    };

    let mut migrated = HashMap::new();
    for (run_id, raw) in entries {
        let mut record: SubagentRunRecord = match serde_json::from_value(raw.clone()) {
            Ok(record) => record,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "skipping unreadable v1 registry entry");
                continue;
            }
        };
        if record.run_id.is_empty() {
            record.run_id = run_id.clone();
        }

        record.cleanup_completed_at = raw.get("announceCompletedAt").and_then(Value::as_i64);
        record.cleanup_handled = raw
            .get("announceHandled")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || record.cleanup_completed_at.is_some();

        if record.requester_origin.is_none() {
            let candidate = DeliveryContext {
                channel: raw
                    .get("requesterChannel")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                account_id: raw
                    .get("requesterAccountId")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                ..Default::default()
            };
            record.requester_origin = DeliveryContext::normalize(&candidate);
        }

        let _ = migrated.insert(run_id.clone(), record);
    }
    migrated
}
