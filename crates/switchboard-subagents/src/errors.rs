//! Errors raised by the orchestration core.

use thiserror::Error;

/// Failure of a queued lane task before or during execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaneError {
    /// The lane was cleared while the task was still queued.
    ///
    /// Fire-and-forget callers are expected to catch or ignore this
    /// specific variant.
    #[error("lane '{lane}' cleared while task was queued")]
    Cleared {
        /// Lane the task was queued on.
        lane: String,
    },

    /// The task was started but never produced a result (panicked or was
    /// torn down with the runtime).
    #[error("lane '{lane}' task aborted before completing")]
    Aborted {
        /// Lane the task ran on.
        lane: String,
    },
}

/// Rejection of a spawn request before a child run is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// The `task` parameter was empty.
    #[error("spawn requires a non-empty task")]
    EmptyTask,

    /// The requested agent id is not in the requester's allow list.
    #[error("agent '{agent_id}' is not allowed for this requester")]
    AgentNotAllowed {
        /// The rejected agent id.
        agent_id: String,
    },
}

/// Failure writing or reading the persisted run registry.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem error.
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed registry payload.
    #[error("registry parse error: {0}")]
    Json(#[from] serde_json::Error),
}
