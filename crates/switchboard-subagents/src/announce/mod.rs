//! Completion announcements.
//!
//! When a child run finishes, its result is packaged into a trigger
//! message for the parent conversation. The [`queue`] decides whether
//! that message is steered into a live run, held until the parent is
//! idle, or handed back for direct delivery; the [`flow`] produces the
//! message itself and drives delivery end-to-end; [`stats`] formats the
//! run statistics line.

pub mod flow;
pub mod queue;
pub mod stats;

pub use flow::{
    run_subagent_announce_flow, AnnounceDeps, AnnounceOptions, AnnounceOutcome, ANNOUNCE_SKIP,
    NO_REPLY,
};
pub use queue::{AnnounceDisposition, AnnounceMode, AnnounceQueue, Announcement};
pub use stats::{estimate_cost_usd, format_duration_compact, stats_line, RunStats};
