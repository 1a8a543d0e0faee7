//! # switchboard-core
//!
//! Shared foundation for the switchboard multi-channel chat gateway.
//!
//! - **Ids**: branded run id newtype (UUID v7, time-ordered)
//! - **Errors**: gateway and settings error hierarchies built on `thiserror`
//! - **Delivery**: channel-routing tuple (`DeliveryContext`) with
//!   normalization, merge, and bucket-key derivation
//! - **Session keys**: the `agent:<id>:subagent:<uuid>` grammar and
//!   canonicalization rules
//! - **Gateway / store**: trait contracts for the model-invocation gateway
//!   and the on-disk session store, consumed by the orchestration core and
//!   mocked in tests
//! - **Events**: in-process lifecycle event bus over `tokio::sync::broadcast`
//! - **Settings**: compiled defaults + JSON deep-merge + env overrides

#![deny(unsafe_code)]

pub mod delivery;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod logging;
pub mod session_keys;
pub mod settings;
pub mod store;

pub use delivery::{DeliveryContext, ThreadId};
pub use errors::{GatewayError, SettingsError};
pub use events::{now_millis, LifecycleBus, LifecycleEvent, LifecyclePhase};
pub use gateway::{AgentRequest, AgentWaitReply, Gateway, SessionsSpawnRequest, WaitStatus};
pub use ids::RunId;
pub use settings::Settings;
pub use store::{EmbeddedRunProbe, SessionEntry, SessionStore, TokenUsage};
