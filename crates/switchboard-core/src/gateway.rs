//! Gateway RPC contract.
//!
//! The model-invocation gateway is an external collaborator reached over
//! RPC. The orchestration core consumes four methods: `agent` (send a
//! message through an agent, optionally delivering the final reply to a
//! channel), `agent.wait` (block until a run reaches a terminal state),
//! `sessions.patch`, and `sessions.delete`. Wire shapes are camelCase
//! JSON matching the gateway protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryContext, ThreadId};
use crate::errors::GatewayError;

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters of the `agent` method.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRequest {
    /// Target session key.
    pub session_key: String,
    /// Message text handed to the agent.
    pub message: String,
    /// Deliver the final reply to the channel instead of returning it.
    pub deliver: bool,
    /// Delivery channel override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Delivery account override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Delivery recipient override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Delivery thread override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    /// Dedup key; a retry with the same key is not re-executed.
    pub idempotency_key: String,
    /// Wait for the final reply rather than the first acknowledgement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_final: Option<bool>,
}

impl AgentRequest {
    /// Build a delivering request routed by a captured origin.
    #[must_use]
    pub fn deliver_to(
        session_key: impl Into<String>,
        message: impl Into<String>,
        origin: Option<&DeliveryContext>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            message: message.into(),
            deliver: true,
            channel: origin.and_then(|o| o.channel.clone()),
            account_id: origin.and_then(|o| o.account_id.clone()),
            to: origin.and_then(|o| o.to.clone()),
            thread_id: origin.and_then(|o| o.thread_id.clone()),
            idempotency_key: idempotency_key.into(),
            expect_final: Some(true),
        }
    }
}

/// Parameters of the `sessions.spawn` method: start a child run in its
/// own session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsSpawnRequest {
    /// Session key the child run lives under.
    pub session_key: String,
    /// Run id minted by the caller.
    pub run_id: String,
    /// Task text handed to the child agent.
    pub task: String,
    /// Model override; absent uses the gateway default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thinking level override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Run timeout in milliseconds; absent means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
}

/// Terminal status reported by `agent.wait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    /// Run finished normally.
    Ok,
    /// Run finished with an error (including cascaded stops).
    Error,
    /// The wait window elapsed, or the run hit its own timeout.
    Timeout,
}

/// Result of the `agent.wait` method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWaitReply {
    /// Terminal status of the run.
    pub status: WaitStatus,
    /// When the run started, epoch millis, if the gateway knows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// When the run ended, epoch millis, if the gateway knows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Error detail for `status == error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway trait
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound RPC surface of the model-invocation gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a message through an agent; resolves when the run is final.
    async fn agent(&self, request: AgentRequest) -> Result<(), GatewayError>;

    /// Wait up to `timeout_ms` for a run to reach a terminal state.
    async fn agent_wait(
        &self,
        run_id: &str,
        timeout_ms: u64,
    ) -> Result<AgentWaitReply, GatewayError>;

    /// Start a child run in its own session; returns once accepted.
    async fn sessions_spawn(&self, request: SessionsSpawnRequest) -> Result<(), GatewayError>;

    /// Patch a session's label.
    async fn sessions_patch(&self, session_key: &str, label: &str) -> Result<(), GatewayError>;

    /// Delete a session; transcripts are soft-deleted by rename when
    /// `delete_transcript` is set.
    async fn sessions_delete(
        &self,
        session_key: &str,
        delete_transcript: bool,
    ) -> Result<(), GatewayError>;
}
