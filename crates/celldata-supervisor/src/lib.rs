//! Cellular packet-data session supervisor.
//!
//! This crate contains:
//! - **Supervisor**: the session state machine driving setup, retry and teardown
//! - **APN catalog**: carrier table parsing, preferred-APN tracking, candidate lists
//! - **Retry policy**: delay-schedule parsing with jitter and unlimited mode
//! - **Connection slots**: bounded packet-context pool with generation-checked completions
//! - **Stall detection**: traffic-counter polling with escalating recovery
//! - **Runtime**: a worker thread hosting the supervisor behind a channel

pub mod apn;
pub mod cause;
pub mod collab;
pub mod config;
pub mod error;
pub mod event;
pub mod netstat;
pub mod notify;
pub mod retry;
pub mod runtime;
pub mod slot;
pub mod supervisor;

pub mod testing;

pub use apn::{ApnCatalog, ApnSetting, ApnType};
pub use cause::FailCause;
pub use collab::Collaborators;
pub use config::SupervisorConfig;
pub use event::{Event, Reason, TimerKind, TimerToken};
pub use notify::Notification;
pub use runtime::{EventSender, SupervisorRuntime};
pub use supervisor::{CapabilityRequest, DataSessionSupervisor, SessionSnapshot, SessionState};
