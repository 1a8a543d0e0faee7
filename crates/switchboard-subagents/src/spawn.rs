//! Spawn entry point and subagent tool policy.
//!
//! `spawn` validates the tool parameters, mints the run id and child
//! session key, dispatches the child run onto the global `subagent` lane,
//! and registers the run — then returns immediately with an `accepted`
//! result. It never blocks on the child.
//!
//! Nested spawning is forbidden by policy: subagent sessions lose the
//! session tools by default, and configuration can only widen or narrow
//! that explicitly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use switchboard_core::delivery::DeliveryContext;
use switchboard_core::gateway::{Gateway, SessionsSpawnRequest};
use switchboard_core::ids::RunId;
use switchboard_core::session_keys::subagent_session_key;
use switchboard_core::settings::{Settings, ToolPolicyConfig};

use crate::errors::{LaneError, SpawnError};
use crate::lanes::{EnqueueOptions, LaneQueue};
use crate::registry::record::CleanupMode;
use crate::registry::{RegisterParams, SubagentRegistry};

/// The global lane every child run starts on.
pub const SUBAGENT_LANE: &str = "subagent";

/// Session tools denied inside subagent sessions unless explicitly
/// re-allowed. Keeps a child from spawning children of its own.
pub const DEFAULT_SUBAGENT_TOOL_DENY: &[&str] = &[
    "sessions_list",
    "sessions_history",
    "sessions_send",
    "sessions_spawn",
];

/// Parameters of the `sessions_spawn` tool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnParams {
    /// Task the child should work on. Required.
    pub task: String,
    /// Short label for the child session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Agent the child runs as; defaults to the requester's agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Model override; unknown values fall back to the default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thinking level override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Run timeout in seconds; 0 means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    /// Cleanup policy, `keep` by default.
    pub cleanup: CleanupMode,
}

/// Immediate result of an accepted spawn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnAccepted {
    /// Always `"accepted"`.
    pub status: String,
    /// Run id of the child.
    pub run_id: String,
    /// Session key the child lives under.
    pub child_session_key: String,
    /// Non-fatal validation notes (e.g. a model fallback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Who is spawning, as captured from the inbound message.
#[derive(Clone, Debug)]
pub struct SpawnRequester {
    /// Parent conversation key.
    pub session_key: String,
    /// Agent id of the parent conversation.
    pub agent_id: String,
    /// Delivery context of the spawning message.
    pub origin: Option<DeliveryContext>,
    /// Human-readable parent id.
    pub display_key: Option<String>,
}

/// Spawns child runs on behalf of requester conversations.
pub struct SubagentSpawner {
    lanes: Arc<LaneQueue>,
    registry: Arc<SubagentRegistry>,
    gateway: Arc<dyn Gateway>,
    settings: Arc<Settings>,
}

impl SubagentSpawner {
    /// Wire up a spawner and size the `subagent` lane from settings.
    #[must_use]
    pub fn new(
        lanes: Arc<LaneQueue>,
        registry: Arc<SubagentRegistry>,
        gateway: Arc<dyn Gateway>,
        settings: Arc<Settings>,
    ) -> Self {
        lanes.set_concurrency(
            SUBAGENT_LANE,
            settings.agents.defaults.subagents.max_concurrent,
        );
        Self {
            lanes,
            registry,
            gateway,
            settings,
        }
    }

    /// Accept a spawn request and kick off the child run.
    ///
    /// Returns immediately; the child run starts on the `subagent` lane
    /// and its completion is tracked by the registry.
    pub fn spawn(
        &self,
        requester: &SpawnRequester,
        params: SpawnParams,
    ) -> Result<SpawnAccepted, SpawnError> {
        let task = params.task.trim().to_owned();
        if task.is_empty() {
            return Err(SpawnError::EmptyTask);
        }

        let overrides = self.settings.agent_subagents(&requester.agent_id);
        let child_agent_id = params
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&requester.agent_id)
            .to_owned();
        if child_agent_id != requester.agent_id {
            if let Some(allowed) = overrides.and_then(|o| o.allow_agents.as_ref()) {
                if !allowed.iter().any(|a| a == &child_agent_id) {
                    return Err(SpawnError::AgentNotAllowed {
                        agent_id: child_agent_id,
                    });
                }
            }
        }

        let default_model = overrides
            .and_then(|o| o.model.clone())
            .or_else(|| self.settings.agents.defaults.subagents.model.clone());
        let mut warning = None;
        let model = match params
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            Some(requested) if self.settings.is_known_model(requested) => {
                Some(requested.to_owned())
            }
            Some(requested) => {
                warn!(model = requested, "unknown model override, using default");
                warning = Some(format!(
                    "unknown model '{requested}', the subagent runs with the default model"
                ));
                default_model
            }
            None => default_model,
        };
        let thinking = params
            .thinking
            .or_else(|| overrides.and_then(|o| o.thinking.clone()))
            .or_else(|| self.settings.agents.defaults.subagents.thinking.clone());

        let run_id = RunId::new();
        let child_session_key = subagent_session_key(&child_agent_id, run_id.as_str());
        let run_timeout_ms = params
            .run_timeout_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| secs.saturating_mul(1_000));

        // Kick the child run off on the global lane, fire-and-forget. A
        // lane clear before start is expected during shutdown.
        let gateway = Arc::clone(&self.gateway);
        let spawn_request = SessionsSpawnRequest {
            session_key: child_session_key.clone(),
            run_id: run_id.to_string(),
            task: task.clone(),
            model,
            thinking,
            run_timeout_ms,
        };
        let started = self
            .lanes
            .enqueue(SUBAGENT_LANE, EnqueueOptions::default(), move || async move {
                if let Err(err) = gateway.sessions_spawn(spawn_request).await {
                    warn!(error = %err, "child run start failed");
                }
            });
        let _ = tokio::spawn(async move {
            match started.await {
                Ok(()) => {}
                Err(LaneError::Cleared { lane }) => {
                    debug!(lane = %lane, "queued child run dropped by lane clear");
                }
                Err(err) => {
                    warn!(error = %err, "child run start aborted");
                }
            }
        });

        self.registry.register(RegisterParams {
            run_id: run_id.to_string(),
            child_session_key: child_session_key.clone(),
            requester_session_key: requester.session_key.clone(),
            requester_origin: requester.origin.clone(),
            requester_display_key: requester.display_key.clone(),
            task,
            label: params
                .label
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_owned),
            cleanup: params.cleanup,
            run_timeout_ms,
        });

        Ok(SpawnAccepted {
            status: "accepted".into(),
            run_id: run_id.into_inner(),
            child_session_key,
            warning,
        })
    }
}

/// Whether a tool is usable inside a subagent session.
///
/// Deny always dominates. A non-empty allow list switches to allow-list
/// semantics (deny still overriding); otherwise everything outside the
/// built-in deny list is available.
#[must_use]
pub fn subagent_tool_allowed(policy: &ToolPolicyConfig, tool: &str) -> bool {
    let tool = tool.trim();
    if policy.deny.iter().any(|denied| denied == tool) {
        return false;
    }
    if !policy.allow.is_empty() {
        return policy.allow.iter().any(|allowed| allowed == tool);
    }
    !DEFAULT_SUBAGENT_TOOL_DENY.contains(&tool)
}
