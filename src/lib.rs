//! Collaborative-edit coordination for the Formari form builder.
//!
//! Two cooperating components keep concurrent editing sessions from
//! corrupting the same form document:
//!
//! - [`LeaseLockManager`]: an exclusive, heartbeat-refreshed editing lease
//!   per document, backed by a shared store visible to every session on
//!   every device.
//! - [`TabBroadcastCoordinator`]: a same-device, cross-tab publish/subscribe
//!   channel that announces active-document state, propagates optimistic
//!   edits and answers in-memory sync requests between sibling tabs.
//!
//! The two components share no state; the editing UI composes them. It
//! acquires a lease before allowing edits, heartbeats it while editing, and
//! uses the local channel to keep sibling tabs of the same browser merged
//! and warned.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{ConfigError, CoordConfig};
pub use db::{LeaseStore, MemoryLeaseStore, PgLeaseStore, StoreError};
pub use models::{
    AcquireOutcome, InstanceId, Lease, LeaseEvent, LockStatus, TabMessage, TabMessageKind,
    TabPayload,
};
pub use services::{
    local_channel, AnonymousPrincipal, HandlerId, LeaseLockManager, MessageHandler,
    PrincipalProvider, StaticPrincipal, TabBroadcastCoordinator,
};
