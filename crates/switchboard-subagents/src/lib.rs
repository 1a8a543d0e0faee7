//! # switchboard-subagents
//!
//! Subagent orchestration core of the switchboard chat gateway.
//!
//! - **Lanes**: named FIFO task queues with per-lane concurrency caps
//!   and generation-based reset for in-process restarts
//! - **Subscriptions**: node ↔ session fan-out index for gateway events
//! - **Announce**: per-conversation holding queue, run statistics, and
//!   the end-to-end flow that delivers a child run's result back into
//!   its parent conversation
//! - **Registry**: persisted map of in-flight child runs with lifecycle
//!   listener, `agent.wait` watchers, archive sweeper, and crash recovery
//! - **Spawn**: the `sessions_spawn` entry point and subagent tool policy

#![deny(unsafe_code)]

pub mod announce;
pub mod errors;
pub mod lanes;
pub mod registry;
pub mod spawn;
pub mod subscriptions;

pub use announce::{
    run_subagent_announce_flow, AnnounceDeps, AnnounceDisposition, AnnounceMode, AnnounceOptions,
    AnnounceOutcome, AnnounceQueue, Announcement,
};
pub use errors::{LaneError, PersistError, SpawnError};
pub use lanes::{EnqueueOptions, LaneQueue, WaitOutcome};
pub use registry::record::{CleanupMode, RunOutcome, RunStatus, SubagentRunRecord};
pub use registry::{RegisterParams, SubagentRegistry};
pub use spawn::{
    subagent_tool_allowed, SpawnAccepted, SpawnParams, SpawnRequester, SubagentSpawner,
    DEFAULT_SUBAGENT_TOOL_DENY, SUBAGENT_LANE,
};
pub use subscriptions::{NodeLister, NodeSender, NodeSubscriptionIndex};
