//! Subagent registry: the authoritative map of in-flight child runs.
//!
//! The registry persists every spawned run, listens for lifecycle
//! events, keeps an `agent.wait` watcher per run for cross-process
//! coverage, sweeps archived child sessions, and restores state after a
//! crash. Two independent completion signals (lifecycle event, RPC
//! watcher) may race on one record; the cleanup token
//! ([`SubagentRegistry::begin_subagent_cleanup`]) guarantees at most one
//! announce flow per attempt.

pub mod persist;
pub mod record;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::delivery::DeliveryContext;
use switchboard_core::events::{now_millis, LifecycleBus, LifecycleEvent, LifecyclePhase};
use switchboard_core::gateway::WaitStatus;

use crate::announce::flow::{run_subagent_announce_flow, AnnounceDeps, AnnounceOptions, AnnounceOutcome};
use crate::registry::record::{CleanupMode, RunOutcome, RunStatus, SubagentRunRecord};

/// Wait window for watchers with no run-timeout override.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 600_000;

/// Wait window for the resume paths after a restart: both the post-end
/// announce attempt and the fresh `agent.wait` watcher for a child that
/// had not ended when the process died.
const RESUME_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Archive sweeper period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Parameters for [`SubagentRegistry::register`].
#[derive(Clone, Debug)]
pub struct RegisterParams {
    /// Run id minted at spawn.
    pub run_id: String,
    /// Child session key.
    pub child_session_key: String,
    /// Parent conversation key.
    pub requester_session_key: String,
    /// Captured delivery context of the spawning message.
    pub requester_origin: Option<DeliveryContext>,
    /// Human-readable parent id.
    pub requester_display_key: Option<String>,
    /// Task text.
    pub task: String,
    /// Short label.
    pub label: Option<String>,
    /// Cleanup policy.
    pub cleanup: CleanupMode,
    /// Run-timeout override in milliseconds; `None` uses the agent-level
    /// default wait window.
    pub run_timeout_ms: Option<u64>,
}

/// Process-wide registry of active child runs.
pub struct SubagentRegistry {
    deps: AnnounceDeps,
    bus: LifecycleBus,
    runs_path: PathBuf,
    runs: DashMap<String, SubagentRunRecord>,
    resumed: Mutex<HashSet<String>>,
    initialized: AtomicBool,
    listener_started: AtomicBool,
    sweeper_running: AtomicBool,
    shutdown: CancellationToken,
}

impl SubagentRegistry {
    /// Create a registry bound to its collaborators.
    ///
    /// The persistence path and archive policy come from
    /// `deps.settings`; nothing is read from disk until [`Self::init`].
    #[must_use]
    pub fn new(deps: AnnounceDeps, bus: LifecycleBus) -> Arc<Self> {
        let runs_path = deps.settings.subagent_runs_path();
        Arc::new(Self {
            deps,
            bus,
            runs_path,
            runs: DashMap::new(),
            resumed: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            listener_started: AtomicBool::new(false),
            sweeper_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public surface
    // ─────────────────────────────────────────────────────────────────────

    /// Track a freshly spawned run.
    ///
    /// Persists the record, subscribes the lifecycle listener on first
    /// use, starts the archive sweeper when archival is configured, and
    /// launches the `agent.wait` watcher for this run.
    pub fn register(self: &Arc<Self>, params: RegisterParams) {
        let now = now_millis();
        let record = SubagentRunRecord {
            run_id: params.run_id.clone(),
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_origin: params
                .requester_origin
                .as_ref()
                .and_then(DeliveryContext::normalize),
            requester_display_key: params.requester_display_key,
            task: params.task,
            label: params.label,
            cleanup: params.cleanup,
            created_at: now,
            archive_at_ms: self
                .deps
                .settings
                .subagent_archive_after_ms()
                .map(|ttl| now + ttl),
            ..Default::default()
        };
        let _ = self.runs.insert(params.run_id.clone(), record);
        self.persist();

        self.ensure_listener();
        self.ensure_sweeper();

        // A run-timeout override makes a `timeout` reply terminal: the
        // gateway killed the run at that deadline. With the default wait
        // window, `timeout` only means the window elapsed while the run
        // continues, so the watcher leaves it for another trigger.
        let announce_on_timeout = params.run_timeout_ms.is_some();
        let timeout_ms = params.run_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
        let registry = Arc::clone(self);
        let run_id = params.run_id;
        let _ = tokio::spawn(async move {
            registry.watch_run(run_id, timeout_ms, announce_on_timeout).await;
        });
    }

    /// Drop a run from memory and disk.
    pub fn release(&self, run_id: &str) {
        if self.runs.remove(run_id).is_some() {
            self.persist();
        }
    }

    /// Runs spawned by one requester conversation.
    #[must_use]
    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRunRecord> {
        self.runs
            .iter()
            .filter(|entry| entry.requester_session_key == requester_session_key)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// A snapshot of one record.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Number of tracked runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether no runs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Restore persisted runs once per process.
    ///
    /// Records already in memory win over restored copies. Each
    /// restored record is resumed at most once: completed records are
    /// skipped, ended ones get an announce attempt, the rest get a fresh
    /// watcher.
    pub async fn init(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let loaded = persist::load_registry(&self.runs_path);
        let mut restored = Vec::new();
        for (run_id, record) in loaded.runs {
            if self.runs.contains_key(&run_id) {
                continue;
            }
            let _ = self.runs.insert(run_id, record.clone());
            restored.push(record);
        }
        if loaded.migrated {
            self.persist();
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "restored subagent runs from disk");
            self.ensure_listener();
            self.ensure_sweeper();
        }
        for record in restored {
            self.resume_record(record);
        }
    }

    /// Stop the lifecycle listener and sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cleanup token
    // ─────────────────────────────────────────────────────────────────────

    /// Atomically claim the announce flow for a run.
    ///
    /// Returns `true` exactly once per attempt: only the caller that
    /// flips `cleanup_handled` from `false` to `true` proceeds. A run
    /// whose cleanup already completed can never be claimed again.
    pub fn begin_subagent_cleanup(&self, run_id: &str) -> bool {
        let won = {
            let Some(mut entry) = self.runs.get_mut(run_id) else {
                return false;
            };
            if entry.cleanup_completed_at.is_some() || entry.cleanup_handled {
                false
            } else {
                entry.cleanup_handled = true;
                true
            }
        };
        if won {
            self.persist();
        }
        won
    }

    /// Settle a run after an announce attempt.
    ///
    /// `delete` removes the record; a failed announce releases the token
    /// so a later trigger can retry; success stamps
    /// `cleanup_completed_at`.
    pub fn finalize_subagent_cleanup(
        &self,
        run_id: &str,
        cleanup: CleanupMode,
        did_announce: bool,
    ) {
        match cleanup {
            CleanupMode::Delete => {
                let _ = self.runs.remove(run_id);
            }
            CleanupMode::Keep => {
                if let Some(mut entry) = self.runs.get_mut(run_id) {
                    if did_announce {
                        entry.cleanup_completed_at = Some(now_millis());
                    } else {
                        entry.cleanup_handled = false;
                    }
                }
            }
        }
        self.persist();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completion triggers
    // ─────────────────────────────────────────────────────────────────────

    fn ensure_listener(self: &Arc<Self>) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        let shutdown = self.shutdown.clone();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => registry.handle_lifecycle(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "lifecycle listener lagged behind the bus");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn handle_lifecycle(self: &Arc<Self>, event: LifecycleEvent) {
        match event.phase {
            LifecyclePhase::Start => {
                let known = {
                    if let Some(mut entry) = self.runs.get_mut(&event.run_id) {
                        entry.started_at = Some(event.at);
                        true
                    } else {
                        false
                    }
                };
                if known {
                    self.persist();
                }
            }
            LifecyclePhase::End => {
                self.complete_run(&event.run_id, RunStatus::Ok, None, Some(event.at), None);
            }
            LifecyclePhase::Error => {
                self.complete_run(
                    &event.run_id,
                    RunStatus::Error,
                    None,
                    Some(event.at),
                    event.error,
                );
            }
        }
    }

    /// Per-run `agent.wait` watcher, covering completions the lifecycle
    /// bus never carries (other processes, missed events).
    async fn watch_run(
        self: Arc<Self>,
        run_id: String,
        timeout_ms: u64,
        announce_on_timeout: bool,
    ) {
        let reply = match self.deps.gateway.agent_wait(&run_id, timeout_ms).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "agent.wait watcher failed");
                return;
            }
        };
        let status = match reply.status {
            WaitStatus::Ok => RunStatus::Ok,
            WaitStatus::Error => RunStatus::Error,
            WaitStatus::Timeout if announce_on_timeout => RunStatus::Timeout,
            WaitStatus::Timeout => {
                debug!(run_id = %run_id, "wait window elapsed without a terminal state");
                return;
            }
        };
        self.complete_run(&run_id, status, reply.started_at, reply.ended_at, reply.error);
    }

    /// Shared end logic for the lifecycle listener and the RPC watcher.
    fn complete_run(
        self: &Arc<Self>,
        run_id: &str,
        status: RunStatus,
        started_at: Option<i64>,
        ended_at: Option<i64>,
        error_detail: Option<String>,
    ) {
        let known = {
            if let Some(mut entry) = self.runs.get_mut(run_id) {
                if entry.started_at.is_none() {
                    entry.started_at = started_at;
                }
                if entry.ended_at.is_none() {
                    entry.ended_at = Some(ended_at.unwrap_or_else(now_millis));
                }
                if entry.outcome.is_none() {
                    entry.outcome = Some(RunOutcome {
                        status,
                        error: error_detail,
                    });
                }
                true
            } else {
                false
            }
        };
        if !known {
            return;
        }
        self.persist();

        if self.begin_subagent_cleanup(run_id) {
            let registry = Arc::clone(self);
            let run_id = run_id.to_owned();
            let _ = tokio::spawn(async move {
                registry
                    .run_cleanup(
                        run_id,
                        AnnounceOptions {
                            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
                            wait_for_completion: false,
                            ..Default::default()
                        },
                    )
                    .await;
            });
        }
    }

    /// Run the announce flow for a claimed record and settle the token.
    async fn run_cleanup(self: Arc<Self>, run_id: String, opts: AnnounceOptions) {
        let Some(mut snapshot) = self.get(&run_id) else {
            return;
        };
        let cleanup = snapshot.cleanup;
        let outcome = run_subagent_announce_flow(&self.deps, &mut snapshot, &opts).await;

        // Adopt timestamps and outcome the flow learned from the gateway.
        {
            if let Some(mut entry) = self.runs.get_mut(&run_id) {
                if entry.started_at.is_none() {
                    entry.started_at = snapshot.started_at;
                }
                if entry.ended_at.is_none() {
                    entry.ended_at = snapshot.ended_at;
                }
                if entry.outcome.is_none() {
                    entry.outcome = snapshot.outcome.clone();
                }
            }
        }

        match outcome {
            AnnounceOutcome::Deferred => {
                // The child session is kept and the record stays
                // retryable, regardless of cleanup policy.
                if let Some(mut entry) = self.runs.get_mut(&run_id) {
                    entry.cleanup_handled = false;
                }
                self.persist();
            }
            _ => self.finalize_subagent_cleanup(&run_id, cleanup, outcome.did_announce()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Resume
    // ─────────────────────────────────────────────────────────────────────

    fn resume_record(self: &Arc<Self>, mut record: SubagentRunRecord) {
        {
            let mut resumed = self.resumed.lock();
            if !resumed.insert(record.run_id.clone()) {
                return;
            }
        }
        if record.cleanup_completed_at.is_some() {
            return;
        }

        // A token left set by a crash mid-announce would block this run
        // forever; no flow can be in flight in a fresh process.
        if record.cleanup_handled {
            if let Some(mut entry) = self.runs.get_mut(&record.run_id) {
                entry.cleanup_handled = false;
            }
            record.cleanup_handled = false;
            self.persist();
        }

        if record.has_ended() {
            if self.begin_subagent_cleanup(&record.run_id) {
                let registry = Arc::clone(self);
                let run_id = record.run_id;
                let _ = tokio::spawn(async move {
                    registry
                        .run_cleanup(
                            run_id,
                            AnnounceOptions {
                                wait_timeout_ms: RESUME_WAIT_TIMEOUT_MS,
                                wait_for_completion: false,
                                ..Default::default()
                            },
                        )
                        .await;
                });
            }
        } else {
            let registry = Arc::clone(self);
            let run_id = record.run_id;
            let _ = tokio::spawn(async move {
                registry
                    .watch_run(run_id, RESUME_WAIT_TIMEOUT_MS, false)
                    .await;
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Archive sweeper
    // ─────────────────────────────────────────────────────────────────────

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.deps.settings.subagent_archive_after_ms().is_none() {
            return;
        }
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let _ = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if registry.sweep_archived().await {
                            break;
                        }
                    }
                }
            }
            registry.sweeper_running.store(false, Ordering::SeqCst);
        });
    }

    /// Remove records past their archive deadline and delete their child
    /// sessions. Returns `true` when the registry is empty afterwards,
    /// which stops the sweeper until a new run starts it again.
    async fn sweep_archived(&self) -> bool {
        let now = now_millis();
        let expired: Vec<(String, String)> = self
            .runs
            .iter()
            .filter(|entry| entry.archive_at_ms.is_some_and(|at| at <= now))
            .map(|entry| (entry.run_id.clone(), entry.child_session_key.clone()))
            .collect();

        if !expired.is_empty() {
            for (run_id, child_key) in &expired {
                let _ = self.runs.remove(run_id);
                if let Err(err) = self.deps.gateway.sessions_delete(child_key, true).await {
                    warn!(run_id = %run_id, error = %err, "archive sweep session delete failed");
                }
            }
            debug!(count = expired.len(), "archived expired subagent sessions");
            self.persist();
        }
        self.runs.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    fn persist(&self) {
        let snapshot: HashMap<String, SubagentRunRecord> = self
            .runs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if let Err(err) = persist::save_registry(&self.runs_path, &snapshot) {
            error!(path = ?self.runs_path, error = %err, "failed to persist subagent registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use switchboard_core::errors::GatewayError;
    use switchboard_core::gateway::{AgentRequest, AgentWaitReply, Gateway};
    use switchboard_core::settings::Settings;
    use switchboard_core::store::{EmbeddedRunProbe, SessionEntry, SessionStore, TokenUsage};

    use crate::announce::queue::{AnnounceMode, AnnounceQueue};

    #[derive(Default)]
    struct StubGateway {
        sent: Mutex<Vec<AgentRequest>>,
        deleted: Mutex<Vec<String>>,
        wait_reply: Mutex<Option<AgentWaitReply>>,
        wait_calls: AtomicUsize,
        wait_timeouts: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Gateway for StubGateway {
        async fn agent(&self, request: AgentRequest) -> Result<(), GatewayError> {
            self.sent.lock().push(request);
            Ok(())
        }

        async fn agent_wait(
            &self,
            run_id: &str,
            timeout_ms: u64,
        ) -> Result<AgentWaitReply, GatewayError> {
            let _ = self.wait_calls.fetch_add(1, Ordering::SeqCst);
            self.wait_timeouts.lock().push(timeout_ms);
            let reply = self.wait_reply.lock().clone();
            match reply {
                Some(reply) => Ok(reply),
                None => {
                    // Simulate a wait that never resolves terminally.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(GatewayError::rpc("agent.wait", format!("{run_id} gone")))
                }
            }
        }

        async fn sessions_spawn(
            &self,
            _: switchboard_core::gateway::SessionsSpawnRequest,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn sessions_patch(&self, _: &str, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn sessions_delete(&self, key: &str, _: bool) -> Result<(), GatewayError> {
            self.deleted.lock().push(key.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubStore {
        replies: Mutex<HashMap<String, String>>,
    }

    impl SessionStore for StubStore {
        fn entry(&self, _key: &str) -> Option<SessionEntry> {
            None
        }

        fn latest_reply(&self, key: &str) -> Option<String> {
            self.replies.lock().get(key).cloned()
        }

        fn token_usage(&self, _key: &str) -> Option<TokenUsage> {
            None
        }

        fn transcript_path(&self, _key: &str) -> Option<std::path::PathBuf> {
            None
        }
    }

    struct IdleProbe;

    #[async_trait]
    impl EmbeddedRunProbe for IdleProbe {
        fn is_embedded_run_active(&self, _key: &str) -> bool {
            false
        }

        async fn steer(&self, _key: &str, _text: &str) -> bool {
            false
        }
    }

    struct Fixture {
        registry: Arc<SubagentRegistry>,
        gateway: Arc<StubGateway>,
        store: Arc<StubStore>,
        bus: LifecycleBus,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            state_dir: Some(dir.path().display().to_string()),
            ..Default::default()
        });

        let gateway = Arc::new(StubGateway::default());
        let store = Arc::new(StubStore::default());
        let probe = Arc::new(IdleProbe);
        let queue = Arc::new(AnnounceQueue::new(
            AnnounceMode::Followup,
            settings.session.main_key.clone(),
            probe.clone() as Arc<dyn EmbeddedRunProbe>,
        ));
        let bus = LifecycleBus::new();

        let registry = SubagentRegistry::new(
            AnnounceDeps {
                gateway: gateway.clone(),
                sessions: store.clone(),
                probe,
                queue,
                settings,
            },
            bus.clone(),
        );
        Fixture {
            registry,
            gateway,
            store,
            bus,
            _dir: dir,
        }
    }

    fn params(run_id: &str) -> RegisterParams {
        RegisterParams {
            run_id: run_id.into(),
            child_session_key: format!("agent:helper:subagent:{run_id}"),
            requester_session_key: "main".into(),
            requester_origin: Some(DeliveryContext {
                channel: Some("slack".into()),
                to: Some("U1".into()),
                ..Default::default()
            }),
            requester_display_key: Some("slack:U1".into()),
            task: "dig through the logs".into(),
            label: Some("logs".into()),
            cleanup: CleanupMode::Keep,
            run_timeout_ms: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn register_persists_and_lists() {
        let f = fixture();
        f.registry.register(params("r-1"));
        f.registry.register(params("r-2"));

        assert_eq!(f.registry.len(), 2);
        assert_eq!(f.registry.list_for_requester("main").len(), 2);
        assert!(f.registry.list_for_requester("other").is_empty());

        let on_disk = persist::load_registry(&f.registry.runs_path);
        assert_eq!(on_disk.runs.len(), 2);
        assert!(on_disk.runs["r-1"].archive_at_ms.is_some());

        f.registry.release("r-1");
        assert_eq!(f.registry.len(), 1);
        let on_disk = persist::load_registry(&f.registry.runs_path);
        assert_eq!(on_disk.runs.len(), 1);
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn cleanup_token_is_claimed_exactly_once() {
        let f = fixture();
        f.registry.register(params("r-1"));

        assert!(f.registry.begin_subagent_cleanup("r-1"));
        assert!(!f.registry.begin_subagent_cleanup("r-1"));
        assert!(!f.registry.begin_subagent_cleanup("missing"));

        // Failed announce releases the token for a retry.
        f.registry
            .finalize_subagent_cleanup("r-1", CleanupMode::Keep, false);
        assert!(f.registry.begin_subagent_cleanup("r-1"));

        // Success seals the record for good.
        f.registry
            .finalize_subagent_cleanup("r-1", CleanupMode::Keep, true);
        assert!(!f.registry.begin_subagent_cleanup("r-1"));
        let record = f.registry.get("r-1").unwrap();
        assert!(record.cleanup_completed_at.is_some());
        assert!(record.cleanup_handled, "completed implies handled stays set");
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn lifecycle_end_announces_once() {
        let f = fixture();
        f.registry.register(params("r-1"));
        let _ = f
            .store
            .replies
            .lock()
            .insert("agent:helper:subagent:r-1".into(), "all done".into());

        f.bus
            .emit(LifecycleEvent::now("r-1", LifecyclePhase::Start));
        f.bus.emit(LifecycleEvent::now("r-1", LifecyclePhase::End));
        settle().await;

        let record = f.registry.get("r-1").unwrap();
        assert!(record.started_at.is_some());
        assert!(record.has_ended());
        assert_eq!(record.outcome.as_ref().unwrap().status, RunStatus::Ok);
        assert!(record.cleanup_completed_at.is_some());

        let sent = f.gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("completed successfully"));
        assert!(sent[0].message.contains("all done"));
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn lifecycle_error_announces_failure() {
        let f = fixture();
        f.registry.register(params("r-1"));

        f.bus.emit(
            LifecycleEvent::now("r-1", LifecyclePhase::Error).with_error("stopped by user"),
        );
        settle().await;

        let sent = f.gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("failed: stopped by user"));
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn racing_triggers_announce_exactly_once() {
        let f = fixture();
        f.registry.register(params("r-1"));
        let _ = f
            .store
            .replies
            .lock()
            .insert("agent:helper:subagent:r-1".into(), "raced".into());

        // Lifecycle end and a mirrored watcher resolution within a
        // hair's breadth of each other.
        let at = now_millis();
        f.bus.emit(LifecycleEvent {
            run_id: "r-1".into(),
            phase: LifecyclePhase::End,
            at,
            error: None,
        });
        f.registry
            .complete_run("r-1", RunStatus::Ok, None, Some(at), None);
        settle().await;

        assert_eq!(f.gateway.sent.lock().len(), 1);
        let record = f.registry.get("r-1").unwrap();
        assert!(record.cleanup_completed_at.is_some());
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn watcher_announces_timeout_for_run_timeout_override() {
        let f = fixture();
        let _ = f.gateway.wait_reply.lock().insert(AgentWaitReply {
            status: WaitStatus::Timeout,
            started_at: Some(1_000),
            ended_at: Some(6_000),
            error: None,
        });
        let mut p = params("r-1");
        p.run_timeout_ms = Some(5_000);
        f.registry.register(p);
        settle().await;

        let sent = f.gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("timed out"));
        assert!(sent[0].message.contains("(no output)"));
        let record = f.registry.get("r-1").unwrap();
        assert_eq!(record.outcome.as_ref().unwrap().status, RunStatus::Timeout);
        assert!(record.cleanup_completed_at.is_some(), "record kept for keep cleanup");
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn watcher_ignores_wait_window_expiry_without_override() {
        let f = fixture();
        let _ = f.gateway.wait_reply.lock().insert(AgentWaitReply {
            status: WaitStatus::Timeout,
            started_at: None,
            ended_at: None,
            error: None,
        });
        f.registry.register(params("r-1"));
        settle().await;

        assert!(f.gateway.sent.lock().is_empty());
        let record = f.registry.get("r-1").unwrap();
        assert!(!record.has_ended());
        assert!(!record.cleanup_handled);
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn sweep_removes_expired_records_and_sessions() {
        let f = fixture();
        f.registry.register(params("r-1"));
        f.registry.register(params("r-2"));

        // Force r-1 past its deadline.
        {
            let mut entry = f.registry.runs.get_mut("r-1").unwrap();
            entry.archive_at_ms = Some(now_millis() - 1);
        }

        let empty = f.registry.sweep_archived().await;
        assert!(!empty);
        assert!(f.registry.get("r-1").is_none());
        assert!(f.registry.get("r-2").is_some());
        assert_eq!(
            f.gateway.deleted.lock().as_slice(),
            ["agent:helper:subagent:r-1".to_owned()]
        );
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn init_restores_and_resumes_ended_runs() {
        let f = fixture();
        f.registry.register(params("r-ended"));
        f.registry.register(params("r-open"));
        {
            let mut entry = f.registry.runs.get_mut("r-ended").unwrap();
            entry.ended_at = Some(now_millis());
            entry.outcome = Some(RunOutcome::status(RunStatus::Ok));
        }
        f.registry.persist();
        let _ = f
            .store
            .replies
            .lock()
            .insert("agent:helper:subagent:r-ended".into(), "from last life".into());
        f.registry.shutdown();

        // Fresh process: same state dir, empty memory.
        let g = {
            let settings = f.registry.deps.settings.clone();
            let gateway = Arc::new(StubGateway::default());
            let probe = Arc::new(IdleProbe);
            let queue = Arc::new(AnnounceQueue::new(
                AnnounceMode::Followup,
                settings.session.main_key.clone(),
                probe.clone() as Arc<dyn EmbeddedRunProbe>,
            ));
            let registry = SubagentRegistry::new(
                AnnounceDeps {
                    gateway: gateway.clone(),
                    sessions: f.store.clone(),
                    probe,
                    queue,
                    settings,
                },
                LifecycleBus::new(),
            );
            (registry, gateway)
        };
        let (registry, gateway) = g;

        registry.init().await;
        registry.init().await; // idempotent
        settle().await;

        assert_eq!(registry.len(), 2);

        // Ended run announced from the restored record.
        let sent = gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("from last life"));

        // Open run got a fresh watcher on the short resume window.
        assert_eq!(gateway.wait_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            gateway.wait_timeouts.lock().as_slice(),
            [RESUME_WAIT_TIMEOUT_MS]
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn init_skips_completed_and_resets_stale_tokens() {
        let f = fixture();
        f.registry.register(params("r-done"));
        f.registry.register(params("r-stale"));
        {
            let mut entry = f.registry.runs.get_mut("r-done").unwrap();
            entry.ended_at = Some(1_000);
            entry.cleanup_handled = true;
            entry.cleanup_completed_at = Some(2_000);
        }
        {
            // Crashed mid-announce: token set, never completed.
            let mut entry = f.registry.runs.get_mut("r-stale").unwrap();
            entry.ended_at = Some(1_000);
            entry.outcome = Some(RunOutcome::status(RunStatus::Ok));
            entry.cleanup_handled = true;
        }
        f.registry.persist();
        f.registry.shutdown();

        let settings = f.registry.deps.settings.clone();
        let gateway = Arc::new(StubGateway::default());
        let probe = Arc::new(IdleProbe);
        let queue = Arc::new(AnnounceQueue::new(
            AnnounceMode::Followup,
            settings.session.main_key.clone(),
            probe.clone() as Arc<dyn EmbeddedRunProbe>,
        ));
        let registry = SubagentRegistry::new(
            AnnounceDeps {
                gateway: gateway.clone(),
                sessions: f.store.clone(),
                probe,
                queue,
                settings,
            },
            LifecycleBus::new(),
        );

        registry.init().await;
        settle().await;

        // Completed record untouched, no announce for it.
        let done = registry.get("r-done").unwrap();
        assert_eq!(done.cleanup_completed_at, Some(2_000));

        // Stale token released and the announce retried.
        let sent = gateway.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        let stale = registry.get("r-stale").unwrap();
        assert!(stale.cleanup_completed_at.is_some());
        registry.shutdown();
    }

    #[tokio::test]
    async fn init_resaves_migrated_v1_file_as_v2() {
        let f = fixture();
        std::fs::create_dir_all(f.registry.runs_path.parent().unwrap()).unwrap();
        std::fs::write(
            &f.registry.runs_path,
            serde_json::json!({
                "version": 1,
                "runs": {
                    "r-old": {
                        "runId": "r-old",
                        "childSessionKey": "agent:helper:subagent:r-old",
                        "requesterSessionKey": "main",
                        "task": "from the old world",
                        "cleanup": "keep",
                        "createdAt": 1,
                        "announceCompletedAt": 2,
                        "announceHandled": true,
                        "requesterChannel": "slack"
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        f.registry.init().await;

        let record = f.registry.get("r-old").unwrap();
        assert_eq!(record.cleanup_completed_at, Some(2));
        assert_eq!(
            record
                .requester_origin
                .as_ref()
                .and_then(|o| o.channel.as_deref()),
            Some("slack")
        );

        let content = std::fs::read_to_string(&f.registry.runs_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["runs"]["r-old"]["cleanupCompletedAt"], 2);
        assert!(value["runs"]["r-old"].get("announceHandled").is_none());
        f.registry.shutdown();
    }

    #[tokio::test]
    async fn unknown_run_events_are_ignored() {
        let f = fixture();
        f.registry.register(params("r-1"));
        f.bus
            .emit(LifecycleEvent::now("r-unknown", LifecyclePhase::End));
        settle().await;
        assert!(f.gateway.sent.lock().is_empty());
        f.registry.shutdown();
    }
}
