//! The subagent announce flow.
//!
//! Given a finished (or finishing) child run, gather its reply, compute
//! run statistics, build the trigger message, and deliver it into the
//! parent conversation — once, best-effort. The flow never throws out of
//! its caller: every failure path reports "did not announce" so the
//! registry can retry on the next trigger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use switchboard_core::delivery::DeliveryContext;
use switchboard_core::events::now_millis;
use switchboard_core::gateway::{AgentRequest, Gateway, WaitStatus};
use switchboard_core::session_keys::{canonical_session_key, GLOBAL_KEY, UNKNOWN_KEY};
use switchboard_core::settings::Settings;
use switchboard_core::store::{EmbeddedRunProbe, SessionStore};

use crate::announce::queue::{AnnounceDisposition, AnnounceQueue, Announcement};
use crate::announce::stats::{estimate_cost_usd, stats_line, RunStats};
use crate::registry::record::{CleanupMode, RunOutcome, RunStatus, SubagentRunRecord};

/// Child reply that suppresses the announcement entirely.
pub const ANNOUNCE_SKIP: &str = "ANNOUNCE_SKIP";

/// Sentinel the parent model may answer with to suppress user output.
pub const NO_REPLY: &str = "NO_REPLY";

/// Placeholder findings when the child produced nothing.
const NO_OUTPUT: &str = "(no output)";

/// Upper bound on waiting for the child's embedded run to settle.
const SETTLE_CAP_MS: u64 = 120_000;

/// Upper bound on polling for a late child reply.
const REPLY_CAP_MS: u64 = 15_000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collaborators the flow talks to.
#[derive(Clone)]
pub struct AnnounceDeps {
    /// Gateway RPC surface.
    pub gateway: Arc<dyn Gateway>,
    /// Session store, read-only.
    pub sessions: Arc<dyn SessionStore>,
    /// Embedded-run probe for settle and steer decisions.
    pub probe: Arc<dyn EmbeddedRunProbe>,
    /// The announce queue announcements are offered to.
    pub queue: Arc<AnnounceQueue>,
    /// Settings, for model cost tables and the main-key alias.
    pub settings: Arc<Settings>,
}

/// Per-attempt options.
#[derive(Clone, Debug)]
pub struct AnnounceOptions {
    /// Budget for `agent.wait` and the settle step.
    pub wait_timeout_ms: u64,
    /// Invoke `agent.wait` when no reply was supplied up front.
    pub wait_for_completion: bool,
    /// Reply captured at spawn time, when the caller already has one.
    pub round_one_reply: Option<String>,
    /// How the child is described in the trigger message.
    pub announce_type: String,
}

impl Default for AnnounceOptions {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 600_000,
            wait_for_completion: true,
            round_one_reply: None,
            announce_type: "subagent".into(),
        }
    }
}

/// Result of one announce attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// The announcement was steered, queued, or sent.
    Announced,
    /// The child is still mid-run; retry later, session kept.
    Deferred,
    /// The child asked for silence (`ANNOUNCE_SKIP`).
    Skipped,
    /// Something failed; the registry may retry.
    Failed,
}

impl AnnounceOutcome {
    /// Whether this attempt counts as a successful announce.
    #[must_use]
    pub fn did_announce(&self) -> bool {
        matches!(self, Self::Announced)
    }
}

/// Produce at most one announcement for a finishing child run.
///
/// Mutates `record` in place when `agent.wait` supplies timestamps or an
/// outcome the record lacks; the caller owns persisting those updates.
pub async fn run_subagent_announce_flow(
    deps: &AnnounceDeps,
    record: &mut SubagentRunRecord,
    opts: &AnnounceOptions,
) -> AnnounceOutcome {
    let child_key = record.child_session_key.clone();

    // 1. Settle: never announce "(no output)" into a mid-stream child.
    let settle_cap = opts.wait_timeout_ms.min(SETTLE_CAP_MS);
    if !wait_for_embedded_idle(deps.probe.as_ref(), &child_key, settle_cap).await {
        debug!(run_id = %record.run_id, "child embedded run still active, deferring announce");
        return AnnounceOutcome::Deferred;
    }

    // 2. Acquire the outcome from the gateway when nothing local decides it.
    if opts.round_one_reply.is_none() && opts.wait_for_completion {
        match deps
            .gateway
            .agent_wait(&record.run_id, opts.wait_timeout_ms)
            .await
        {
            Ok(reply) => {
                if record.started_at.is_none() {
                    record.started_at = reply.started_at;
                }
                if record.ended_at.is_none() {
                    record.ended_at = reply.ended_at;
                }
                if record.outcome.is_none() {
                    record.outcome = Some(match reply.status {
                        WaitStatus::Ok => RunOutcome::status(RunStatus::Ok),
                        WaitStatus::Timeout => RunOutcome::status(RunStatus::Timeout),
                        WaitStatus::Error => RunOutcome {
                            status: RunStatus::Error,
                            error: reply.error,
                        },
                    });
                }
            }
            Err(err) => {
                warn!(run_id = %record.run_id, error = %err, "agent.wait failed during announce");
                return AnnounceOutcome::Failed;
            }
        }
    }

    // 3. Acquire the reply, polling briefly for a straggler.
    let mut reply_text = opts
        .round_one_reply
        .clone()
        .unwrap_or_default()
        .trim()
        .to_owned();
    if reply_text.is_empty() {
        reply_text = latest_reply_trimmed(deps.sessions.as_ref(), &child_key);
    }
    if reply_text.is_empty() && may_still_reply(record.outcome.as_ref()) {
        let reply_cap = opts.wait_timeout_ms.min(REPLY_CAP_MS);
        let deadline = Instant::now() + Duration::from_millis(reply_cap);
        while reply_text.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            reply_text = latest_reply_trimmed(deps.sessions.as_ref(), &child_key);
        }
        if reply_text.is_empty() && deps.probe.is_embedded_run_active(&child_key) {
            debug!(run_id = %record.run_id, "child re-activated while waiting for reply, deferring");
            return AnnounceOutcome::Deferred;
        }
    }

    // A child may explicitly request silence.
    if reply_text == ANNOUNCE_SKIP {
        finalize_child_session(deps, record).await;
        return AnnounceOutcome::Skipped;
    }

    // 4. Statistics.
    let entry = deps.sessions.entry(&child_key);
    let usage = deps.sessions.token_usage(&child_key);
    let cost_usd = entry
        .as_ref()
        .and_then(|e| e.model.as_deref())
        .and_then(|m| deps.settings.model_cost(m))
        .zip(usage)
        .map(|(cost, usage)| estimate_cost_usd(&usage, &cost));
    let stats = RunStats {
        usage,
        runtime_ms: record.runtime_ms(),
        cost_usd,
        session_key: child_key.clone(),
        session_id: entry.and_then(|e| e.session_id),
        transcript: deps.sessions.transcript_path(&child_key),
    };

    // 5 + 6. Status label and trigger message.
    let label = record.label.as_deref().unwrap_or(&record.task).to_owned();
    let status = status_label(record.outcome.as_ref());
    let findings = if reply_text.is_empty() {
        NO_OUTPUT
    } else {
        reply_text.as_str()
    };
    let message = build_trigger_message(
        &opts.announce_type,
        &label,
        &status,
        findings,
        &stats_line(&stats),
    );

    // 7. Deliver: offer to the queue, fall through to a direct send.
    let disposition = deps
        .queue
        .offer(Announcement {
            session_key: record.requester_session_key.clone(),
            prompt: message.clone(),
            summary_line: Some(format!("{} \"{label}\" {status}", opts.announce_type)),
            enqueued_at: now_millis(),
            origin: record.requester_origin.clone(),
        })
        .await;

    let announced = match disposition {
        AnnounceDisposition::Steered | AnnounceDisposition::Queued => true,
        AnnounceDisposition::Passthrough => send_direct(deps, record, message).await,
    };

    // 8. Finalize: best-effort label patch and cleanup delete.
    finalize_child_session(deps, record).await;

    if announced {
        AnnounceOutcome::Announced
    } else {
        AnnounceOutcome::Failed
    }
}

/// Wait for the child's embedded run to go idle; `true` when settled.
async fn wait_for_embedded_idle(
    probe: &dyn EmbeddedRunProbe,
    session_key: &str,
    cap_ms: u64,
) -> bool {
    if !probe.is_embedded_run_active(session_key) {
        return true;
    }
    let deadline = Instant::now() + Duration::from_millis(cap_ms);
    while Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !probe.is_embedded_run_active(session_key) {
            return true;
        }
    }
    false
}

/// Whether a late reply is still plausible. A run that errored or timed
/// out will not produce one, so an empty reply goes straight to
/// `(no output)` without the polling window.
fn may_still_reply(outcome: Option<&RunOutcome>) -> bool {
    matches!(
        outcome.map_or(RunStatus::Unknown, |o| o.status),
        RunStatus::Ok | RunStatus::Unknown
    )
}

fn latest_reply_trimmed(sessions: &dyn SessionStore, session_key: &str) -> String {
    sessions
        .latest_reply(session_key)
        .unwrap_or_default()
        .trim()
        .to_owned()
}

/// Human status label, derived strictly from the runtime outcome.
fn status_label(outcome: Option<&RunOutcome>) -> String {
    match outcome.map_or(RunStatus::Unknown, |o| o.status) {
        RunStatus::Ok => "completed successfully".into(),
        RunStatus::Timeout => "timed out".into(),
        RunStatus::Error => {
            let detail = outcome
                .and_then(|o| o.error.as_deref())
                .unwrap_or("unknown error");
            format!("failed: {detail}")
        }
        RunStatus::Unknown => "finished with unknown status".into(),
    }
}

fn build_trigger_message(
    announce_type: &str,
    label: &str,
    status: &str,
    findings: &str,
    stats: &str,
) -> String {
    let instruction = format!(
        "Relay the result above to the user in your own words, making clear it \
         comes from the {announce_type} and keeping the stated outcome accurate. \
         If nothing needs to be surfaced, reply with exactly {NO_REPLY} and no \
         other text."
    );
    format!(
        "A {announce_type} \"{label}\" just {status}.\n\n\
         Findings:\n{findings}\n\n\
         {stats}\n\n\
         {instruction}"
    )
}

/// Direct send into the requester conversation, binary success.
async fn send_direct(deps: &AnnounceDeps, record: &SubagentRunRecord, message: String) -> bool {
    let requester_key = canonical_session_key(
        &record.requester_session_key,
        &deps.settings.session.main_key,
    );
    let session_origin = deps
        .sessions
        .entry(&record.requester_session_key)
        .as_ref()
        .and_then(DeliveryContext::from_session);
    let origin = DeliveryContext::merge(record.requester_origin.as_ref(), session_origin.as_ref());

    if origin.is_none() && (requester_key == GLOBAL_KEY || requester_key == UNKNOWN_KEY) {
        warn!(
            requester = %requester_key,
            run_id = %record.run_id,
            "no delivery route for pseudo-conversation, dropping announcement"
        );
        return false;
    }

    let request = AgentRequest::deliver_to(
        requester_key,
        message,
        origin.as_ref(),
        uuid::Uuid::now_v7().to_string(),
    );
    match deps.gateway.agent(request).await {
        Ok(()) => true,
        Err(err) => {
            warn!(run_id = %record.run_id, error = %err, "direct announce send failed");
            false
        }
    }
}

/// Best-effort label patch and cleanup delete. Failures are swallowed.
async fn finalize_child_session(deps: &AnnounceDeps, record: &SubagentRunRecord) {
    if let Some(label) = &record.label {
        if let Err(err) = deps
            .gateway
            .sessions_patch(&record.child_session_key, label)
            .await
        {
            warn!(run_id = %record.run_id, error = %err, "label patch failed");
        }
    }
    if record.cleanup == CleanupMode::Delete {
        if let Err(err) = deps
            .gateway
            .sessions_delete(&record.child_session_key, true)
            .await
        {
            warn!(run_id = %record.run_id, error = %err, "child session delete failed");
        }
    }
}
