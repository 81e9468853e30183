//! Collaborator seams.
//!
//! The supervisor performs no I/O of its own. Everything it needs from the
//! outside world goes through these narrow traits, injected at
//! construction. Commands are fire-and-forget: their results come back as
//! [`Event`](crate::event::Event)s on the supervisor's queue.

use std::time::Duration;

use crate::apn::{ApnRow, ApnSetting};
use crate::event::{Reason, TimerToken};

/// Packet-context activation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateRequest {
    pub slot: usize,
    pub generation: u64,
    pub apn: ApnSetting,
    pub reason: Reason,
}

/// Packet-context teardown request. The completion must echo `slot` and
/// `generation` in [`Event::DisconnectDone`](crate::event::Event::DisconnectDone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeactivateRequest {
    pub slot: usize,
    pub generation: u64,
    pub cid: u32,
    pub reason: Reason,
}

/// Radio command channel.
pub trait RadioCommands {
    /// Answer with `Event::SetupComplete`.
    fn activate(&mut self, req: ActivateRequest);
    /// Answer with `Event::DisconnectDone`.
    fn deactivate(&mut self, req: DeactivateRequest);
    /// Answer with `Event::ContextList { explicit: true, .. }`.
    fn query_active_contexts(&mut self);
    /// Drop and redo network registration. Detach and attach events follow.
    fn reregister_network(&mut self);
}

/// Carrier APN table.
pub trait ApnTable {
    fn rows_for_operator(&self, operator: &str) -> Vec<ApnRow>;
}

/// Cumulative packet counters of the mobile interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSample {
    pub tx_packets: u64,
    pub rx_packets: u64,
}

pub trait TrafficCounters {
    /// `None` if the counters cannot be read right now.
    fn sample(&mut self) -> Option<TrafficSample>;
}

/// Persistent storage for the preferred APN id.
pub trait PreferenceStore {
    fn load_preferred(&self) -> Option<i64>;
    /// `None` clears the stored preference.
    fn store_preferred(&mut self, id: Option<i64>);
}

/// Single-shot timers. A scheduled token is delivered back as
/// `Event::TimerFired` unless cancelled first.
pub trait TimerScheduler {
    fn schedule(&mut self, token: TimerToken, after: Duration);
    fn cancel(&mut self, token: TimerToken);
}

/// Collaborators that can be built on one thread and moved to the worker.
pub struct Collaborators {
    pub radio: Box<dyn RadioCommands + Send>,
    pub apn_table: Box<dyn ApnTable + Send>,
    pub counters: Box<dyn TrafficCounters + Send>,
    pub prefs: Box<dyn PreferenceStore + Send>,
}
