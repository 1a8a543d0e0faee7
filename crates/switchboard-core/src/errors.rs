//! Error hierarchy for the gateway foundation.
//!
//! - [`GatewayError`]: failures of outbound gateway RPC calls (`agent`,
//!   `agent.wait`, `sessions.*`)
//! - [`SettingsError`]: settings file read/parse failures
//!
//! Orchestration-specific errors (lane clears, spawn rejection, registry
//! persistence) live in the `switchboard-subagents` crate next to the
//! code that raises them.

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// GatewayError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of an outbound gateway RPC call.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway rejected or failed the call.
    #[error("gateway call '{method}' failed: {message}")]
    Rpc {
        /// Method name (e.g. `agent.wait`).
        method: String,
        /// Gateway-reported message.
        message: String,
    },

    /// The call did not complete within its timeout window.
    #[error("gateway call '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method name.
        method: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The gateway returned a payload the core could not interpret.
    #[error("gateway call '{method}' returned an invalid response: {message}")]
    InvalidResponse {
        /// Method name.
        method: String,
        /// What was wrong with the payload.
        message: String,
    },
}

impl GatewayError {
    /// Shorthand for an [`GatewayError::Rpc`] with owned strings.
    #[must_use]
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SettingsError
// ─────────────────────────────────────────────────────────────────────────────

/// Settings file could not be read or parsed.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Filesystem error reading the settings file.
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON, or does not match the schema.
    #[error("settings parse error: {0}")]
    Json(#[from] serde_json::Error),
}
