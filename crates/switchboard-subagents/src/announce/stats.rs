//! Run statistics for announcements.
//!
//! The stats line summarises a finished child run: runtime, token
//! counts, estimated cost, and where to find the session. Missing
//! pieces render as `n/a` so the line shape stays stable.

use std::path::PathBuf;

use switchboard_core::settings::ModelCost;
use switchboard_core::store::TokenUsage;

/// Collected statistics of one child run.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Token usage, when the store has it.
    pub usage: Option<TokenUsage>,
    /// Wall-clock runtime in milliseconds.
    pub runtime_ms: Option<i64>,
    /// Estimated cost in USD.
    pub cost_usd: Option<f64>,
    /// Child session key.
    pub session_key: String,
    /// Store-assigned session id.
    pub session_id: Option<String>,
    /// Transcript path per the session store layout.
    pub transcript: Option<PathBuf>,
}

/// Format a millisecond duration compactly: `800ms`, `42s`, `5m12s`, `2h3m`.
#[must_use]
pub fn format_duration_compact(ms: i64) -> String {
    if ms < 0 {
        return "n/a".into();
    }
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let total_secs = ms / 1_000;
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Estimate run cost in USD from per-million token rates.
#[must_use]
pub fn estimate_cost_usd(usage: &TokenUsage, cost: &ModelCost) -> f64 {
    (usage.input_tokens as f64 * cost.input + usage.output_tokens as f64 * cost.output)
        / 1_000_000.0
}

/// Assemble the stats line, eliding missing pieces to `n/a`.
#[must_use]
pub fn stats_line(stats: &RunStats) -> String {
    let runtime = stats
        .runtime_ms
        .map_or_else(|| "n/a".into(), format_duration_compact);
    let tokens = stats.usage.map_or_else(
        || "n/a".into(),
        |u| {
            format!(
                "{} (in {} / out {})",
                u.total(),
                u.input_tokens,
                u.output_tokens
            )
        },
    );
    let cost = stats
        .cost_usd
        .map_or_else(|| "n/a".into(), format_cost_usd);
    let session_key = if stats.session_key.is_empty() {
        "n/a"
    } else {
        &stats.session_key
    };
    let session_id = stats.session_id.as_deref().unwrap_or("n/a");
    let transcript = stats
        .transcript
        .as_ref()
        .map_or_else(|| "n/a".into(), |p| p.display().to_string());

    format!(
        "runtime {runtime} • tokens {tokens} • est ${cost} • sessionKey {session_key} • sessionId {session_id} • transcript {transcript}"
    )
}

fn format_cost_usd(value: f64) -> String {
    // Four decimals, trimmed back to no fewer than two.
    let mut formatted = format!("{value:.4}");
    if let Some(dot) = formatted.find('.') {
        while formatted.len() - dot - 1 > 2 && formatted.ends_with('0') {
            let _ = formatted.pop();
        }
    }
    formatted
}
