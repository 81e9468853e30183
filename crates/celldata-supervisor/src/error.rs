//! Error types for the session supervisor.
//!
//! Collaborator failures never show up here: activation and teardown
//! failures travel as data ([`FailCause`](crate::cause::FailCause)) through
//! the event queue. These enums cover local configuration problems and
//! protocol misuse inside the supervisor itself.

use thiserror::Error;

use crate::slot::SlotState;

// ── Configuration ───────────────────────────────────────────────────

/// Malformed retry spec, APN row or config file. Always recovered locally
/// (fallback defaults, skipped row).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("retry spec is empty")]
    EmptyRetrySpec,
    #[error("retry spec has no delay values")]
    NoDelays,
    #[error("invalid retry spec entry '{0}'")]
    InvalidRetryEntry(String),
    #[error("unknown retry spec key '{0}'")]
    UnknownRetryKey(String),
    #[error("retry delay in '{entry}' exceeds {max_ms} ms")]
    RetryDelayTooLarge { entry: String, max_ms: u64 },
    #[error("APN row is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("APN row column '{column}' has invalid value '{value}'")]
    InvalidColumn { column: &'static str, value: String },
    #[error("unknown APN capability '{0}'")]
    UnknownCapability(String),
    #[error("invalid config TOML: {0}")]
    Toml(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ── Slots ───────────────────────────────────────────────────────────

/// A slot operation was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot {slot}: cannot {op} while {state:?}")]
    InvalidState {
        slot: usize,
        op: &'static str,
        state: SlotState,
    },
    #[error("no slot with index {0}")]
    UnknownSlot(usize),
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Internal error raised while handling one event. The event loop logs it
/// and keeps draining the queue.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("session invariant violated: {0}")]
    Invariant(String),
}
