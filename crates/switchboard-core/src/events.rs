//! In-process agent lifecycle event bus.
//!
//! The gateway emits a [`LifecycleEvent`] whenever a run starts or
//! reaches a terminal state. The subagent registry subscribes to mirror
//! these into its records. Built on `tokio::sync::broadcast`: emitting
//! never blocks, and a receiver that lags simply drops old events
//! (completion signals are also covered by the `agent.wait` watcher).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer size for the lifecycle channel.
const LIFECYCLE_BUS_CAPACITY: usize = 256;

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Phase of a run's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    /// The run began processing.
    Start,
    /// The run finished normally.
    End,
    /// The run finished with an error (aborts and cascaded stops included).
    Error,
}

/// One lifecycle transition of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Run the event belongs to.
    pub run_id: String,
    /// Which transition occurred.
    pub phase: LifecyclePhase,
    /// Event time, epoch millis.
    pub at: i64,
    /// Error detail for [`LifecyclePhase::Error`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LifecycleEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn now(run_id: impl Into<String>, phase: LifecyclePhase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            at: now_millis(),
            error: None,
        }
    }

    /// Attach an error detail.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Broadcast bus carrying [`LifecycleEvent`]s.
#[derive(Clone, Debug)]
pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIFECYCLE_BUS_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    ///
    /// An event with no subscribers is dropped silently.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}
