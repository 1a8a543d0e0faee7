//! Per-conversation holding queue for completion announcements.
//!
//! Each parent conversation (bucketed by canonical session key) holds a
//! FIFO of pending announcements. The queue's mode decides what happens
//! when an announcement arrives while the parent is busy:
//!
//! | mode | behaviour |
//! |---|---|
//! | `collect` | always enqueue; flush when the parent run ends |
//! | `followup` | enqueue while the parent run is active; direct on idle |
//! | `steer` | inject into a live embedded run; direct when none |
//! | `steer-backlog` | try steer, then fall back to `followup` queueing |
//! | `interrupt` | enqueue like `followup`, for parent-interruptible flows |

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use switchboard_core::delivery::DeliveryContext;
use switchboard_core::gateway::{AgentRequest, Gateway};
use switchboard_core::session_keys::{canonical_session_key, GLOBAL_KEY, UNKNOWN_KEY};
use switchboard_core::store::EmbeddedRunProbe;

/// Flow-control mode of an announce queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnounceMode {
    /// Always enqueue; flush when the parent run ends.
    Collect,
    /// Enqueue while the parent run is active; deliver directly on idle.
    #[default]
    Followup,
    /// Inject into a live embedded run; fall through to direct send.
    Steer,
    /// Try steer; if that fails, enqueue as followup.
    SteerBacklog,
    /// Enqueue like followup, for parent-interruptible flows.
    Interrupt,
}

/// One queued completion message.
#[derive(Clone, Debug)]
pub struct Announcement {
    /// Parent session the message targets (canonicalized on offer).
    pub session_key: String,
    /// Full trigger message text.
    pub prompt: String,
    /// Optional one-line summary for diagnostics.
    pub summary_line: Option<String>,
    /// When the item entered the queue, epoch millis.
    pub enqueued_at: i64,
    /// Captured delivery route of the spawning message.
    pub origin: Option<DeliveryContext>,
}

/// What the queue did with an offered announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceDisposition {
    /// Injected into a live embedded run.
    Steered,
    /// Held for later flush.
    Queued,
    /// Declined; the caller should deliver directly.
    Passthrough,
}

/// Per-conversation announcement queue.
pub struct AnnounceQueue {
    mode: AnnounceMode,
    main_key: String,
    probe: Arc<dyn EmbeddedRunProbe>,
    buckets: Mutex<HashMap<String, VecDeque<Announcement>>>,
}

impl AnnounceQueue {
    /// Create a queue with the given flow-control mode.
    #[must_use]
    pub fn new(mode: AnnounceMode, main_key: impl Into<String>, probe: Arc<dyn EmbeddedRunProbe>) -> Self {
        Self {
            mode,
            main_key: main_key.into(),
            probe,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// The queue's flow-control mode.
    #[must_use]
    pub fn mode(&self) -> AnnounceMode {
        self.mode
    }

    /// Offer an announcement; returns how it was handled.
    ///
    /// The `global` and `unknown` pseudo-conversations are never queued
    /// or steered; those offers come back as
    /// [`AnnounceDisposition::Passthrough`] for the caller's direct send.
    pub async fn offer(&self, mut item: Announcement) -> AnnounceDisposition {
        let key = canonical_session_key(&item.session_key, &self.main_key);
        if key == GLOBAL_KEY || key == UNKNOWN_KEY {
            return AnnounceDisposition::Passthrough;
        }
        item.session_key = key.clone();

        match self.mode {
            AnnounceMode::Collect => {
                self.push(item);
                AnnounceDisposition::Queued
            }
            AnnounceMode::Followup | AnnounceMode::Interrupt => {
                if self.probe.is_embedded_run_active(&key) {
                    self.push(item);
                    AnnounceDisposition::Queued
                } else {
                    AnnounceDisposition::Passthrough
                }
            }
            AnnounceMode::Steer => {
                if self.try_steer(&key, &item.prompt).await {
                    AnnounceDisposition::Steered
                } else {
                    AnnounceDisposition::Passthrough
                }
            }
            AnnounceMode::SteerBacklog => {
                if self.try_steer(&key, &item.prompt).await {
                    AnnounceDisposition::Steered
                } else if self.probe.is_embedded_run_active(&key) {
                    self.push(item);
                    AnnounceDisposition::Queued
                } else {
                    AnnounceDisposition::Passthrough
                }
            }
        }
    }

    /// Deliver every held announcement for a conversation, FIFO.
    ///
    /// Each item goes out through `agent` with `deliver=true`, the
    /// captured origin routing, and a fresh idempotency key. Returns the
    /// number delivered; failed sends are logged and dropped.
    pub async fn flush(&self, session_key: &str, gateway: &dyn Gateway) -> usize {
        let key = canonical_session_key(session_key, &self.main_key);
        let items: Vec<Announcement> = {
            let mut buckets = self.buckets.lock();
            buckets.remove(&key).map(Vec::from).unwrap_or_default()
        };
        if items.is_empty() {
            return 0;
        }
        debug!(session_key = %key, count = items.len(), "flushing announce queue");

        let mut delivered = 0;
        for item in items {
            let request = AgentRequest::deliver_to(
                key.clone(),
                item.prompt,
                item.origin.as_ref(),
                Uuid::now_v7().to_string(),
            );
            match gateway.agent(request).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(session_key = %key, error = %err, "announce flush delivery failed");
                }
            }
        }
        delivered
    }

    /// Number of held announcements for one conversation.
    #[must_use]
    pub fn pending(&self, session_key: &str) -> usize {
        let key = canonical_session_key(session_key, &self.main_key);
        self.buckets.lock().get(&key).map_or(0, VecDeque::len)
    }

    /// Number of held announcements across all conversations.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.buckets.lock().values().map(VecDeque::len).sum()
    }

    fn push(&self, item: Announcement) {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(item.session_key.clone())
            .or_default()
            .push_back(item);
    }

    async fn try_steer(&self, session_key: &str, prompt: &str) -> bool {
        if !self.probe.is_embedded_run_active(session_key) {
            return false;
        }
        self.probe.steer(session_key, prompt).await
    }
}
