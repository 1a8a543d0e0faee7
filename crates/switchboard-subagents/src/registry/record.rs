//! Persisted run records.

use serde::{Deserialize, Serialize};

use switchboard_core::delivery::DeliveryContext;

/// What happens to the child session once its announcement lands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Delete the child session after a successful announce.
    Delete,
    /// Keep the child session until its archive deadline.
    #[default]
    Keep,
}

/// Terminal status of a run, as recorded by the registry.
///
/// Always derived from the runtime signal (lifecycle event or
/// `agent.wait`), never from model output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Finished normally.
    Ok,
    /// Finished with an error.
    Error,
    /// Hit a timeout.
    Timeout,
    /// No terminal signal observed.
    #[default]
    Unknown,
}

/// Terminal outcome with optional error detail.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// Error detail, for [`RunStatus::Error`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    /// Outcome with just a status.
    #[must_use]
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

/// One spawned child run, in memory and on disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentRunRecord {
    /// Opaque unique run id.
    pub run_id: String,
    /// Fully qualified session key of the child.
    pub child_session_key: String,
    /// Session key of the parent conversation.
    pub requester_session_key: String,
    /// Captured delivery context of the spawning message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<DeliveryContext>,
    /// Human-readable parent id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_display_key: Option<String>,
    /// Task the child was asked to do.
    pub task: String,
    /// Short label for the child session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Cleanup policy chosen at spawn.
    pub cleanup: CleanupMode,
    /// When the record was created, epoch millis.
    pub created_at: i64,
    /// When the run started processing, epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// When the run reached a terminal state, epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Terminal outcome, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// When the sweeper should delete the child session, epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_at_ms: Option<i64>,
    /// Cleanup token: an announce flow for this run has started.
    pub cleanup_handled: bool,
    /// Set once an announce succeeded; no further attempts run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<i64>,
}

impl SubagentRunRecord {
    /// Whether the run has reached a terminal state.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.ended_at.unwrap_or(0) > 0
    }

    /// Runtime in milliseconds, when both endpoints are known.
    #[must_use]
    pub fn runtime_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_camel_case() {
        let record = SubagentRunRecord {
            run_id: "r-1".into(),
            child_session_key: "agent:helper:subagent:x".into(),
            requester_session_key: "main".into(),
            task: "summarise foo".into(),
            cleanup: CleanupMode::Keep,
            created_at: 1,
            cleanup_handled: true,
            ..Default::default()
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["runId"], json!("r-1"));
        assert_eq!(v["childSessionKey"], json!("agent:helper:subagent:x"));
        assert_eq!(v["cleanup"], json!("keep"));
        assert_eq!(v["cleanupHandled"], json!(true));
        assert!(v.get("cleanupCompletedAt").is_none());
    }

    #[test]
    fn runtime_needs_both_endpoints() {
        let mut record = SubagentRunRecord::default();
        assert_eq!(record.runtime_ms(), None);
        record.started_at = Some(1_000);
        assert_eq!(record.runtime_ms(), None);
        record.ended_at = Some(4_000);
        assert_eq!(record.runtime_ms(), Some(3_000));
        assert!(record.has_ended());
    }
}
