//! Session store and embedded-run contracts.
//!
//! The on-disk session store is an external collaborator; the
//! orchestration core reads it through [`SessionStore`] and never writes
//! it directly (mutations go through the gateway `sessions.*` methods).
//! [`EmbeddedRunProbe`] answers whether a session is mid-processing and
//! lets the announce queue steer text into a live run.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryContext, ThreadId};

// ─────────────────────────────────────────────────────────────────────────────
// SessionEntry / TokenUsage
// ─────────────────────────────────────────────────────────────────────────────

/// One session's metadata as read from the session store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEntry {
    /// Store-assigned session id (distinct from the session key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Human-visible label, patchable via `sessions.patch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Model the session last ran with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Channel of the most recent inbound message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    /// Recipient of the most recent delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    /// Account of the most recent delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    /// Thread of the most recent delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_thread_id: Option<ThreadId>,
    /// Persisted delivery context, set when the session was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<DeliveryContext>,
    /// Thread id of the message that originally opened the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_thread_id: Option<ThreadId>,
}

/// Token counts accumulated over a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Total tokens in and out.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionStore / EmbeddedRunProbe
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the session store.
pub trait SessionStore: Send + Sync {
    /// Look up a session's metadata by key.
    fn entry(&self, session_key: &str) -> Option<SessionEntry>;

    /// Latest assistant reply text for a session, if any.
    fn latest_reply(&self, session_key: &str) -> Option<String>;

    /// Accumulated token usage for a session.
    fn token_usage(&self, session_key: &str) -> Option<TokenUsage>;

    /// Filesystem path of the session transcript, per the store's layout.
    fn transcript_path(&self, session_key: &str) -> Option<PathBuf>;
}

/// Probe into live run state, backing steer decisions and the settle step.
#[async_trait]
pub trait EmbeddedRunProbe: Send + Sync {
    /// Whether the session currently has an embedded run processing.
    fn is_embedded_run_active(&self, session_key: &str) -> bool;

    /// Inject text into the session's live embedded run.
    ///
    /// Returns `true` when the run accepted the injection.
    async fn steer(&self, session_key: &str, text: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 200,
        };
        assert_eq!(usage.total(), 300);
    }

    #[test]
    fn session_entry_tolerates_sparse_json() {
        let entry: SessionEntry =
            serde_json::from_str(r#"{"lastChannel":"slack","sessionId":"s-1"}"#).unwrap();
        assert_eq!(entry.last_channel.as_deref(), Some("slack"));
        assert_eq!(entry.session_id.as_deref(), Some("s-1"));
        assert_eq!(entry.delivery_context, None);
    }
}
