//! In-memory collaborators and a synchronous harness for driving the
//! supervisor in tests and simulations.
//!
//! Every fake is a cheap handle over shared state: clone it, hand one copy
//! to the supervisor and keep the other to script or inspect.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::apn::{columns, ApnRow};
use crate::cause::FailCause;
use crate::collab::{
    ActivateRequest, ApnTable, Collaborators, DeactivateRequest, PreferenceStore, RadioCommands,
    TimerScheduler, TrafficCounters, TrafficSample,
};
use crate::config::SupervisorConfig;
use crate::event::{Event, Reason, TimerKind, TimerToken};
use crate::notify::{Activity, Notification};
use crate::slot::NetworkParams;
use crate::supervisor::{DataSessionSupervisor, SessionState};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// APN row with the columns every test needs.
pub fn apn_row(id: i64, numeric: &str, apn: &str, types: &str) -> ApnRow {
    ApnRow::new()
        .with(columns::ID, id.to_string())
        .with(columns::NUMERIC, numeric)
        .with(columns::NAME, apn)
        .with(columns::APN, apn)
        .with(columns::TYPE, types)
}

/// Plausible activation result. The second DNS entry is unspecified.
pub fn network_params(cid: u32) -> NetworkParams {
    NetworkParams {
        interface: "rmnet0".into(),
        address: IpAddr::V4(Ipv4Addr::new(10, 64, 0, cid as u8)),
        gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 1))),
        dns: vec![
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ],
        cid,
    }
}

// ─── Radio ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RadioLog {
    activations: Vec<ActivateRequest>,
    deactivations: Vec<DeactivateRequest>,
    context_queries: usize,
    reregistrations: usize,
}

/// Records every command and answers none of them.
#[derive(Debug, Clone, Default)]
pub struct RecordingRadio {
    log: Arc<Mutex<RadioLog>>,
}

impl RecordingRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activations(&self) -> Vec<ActivateRequest> {
        lock(&self.log).activations.clone()
    }

    pub fn deactivations(&self) -> Vec<DeactivateRequest> {
        lock(&self.log).deactivations.clone()
    }

    pub fn context_queries(&self) -> usize {
        lock(&self.log).context_queries
    }

    pub fn reregistrations(&self) -> usize {
        lock(&self.log).reregistrations
    }
}

impl RadioCommands for RecordingRadio {
    fn activate(&mut self, req: ActivateRequest) {
        lock(&self.log).activations.push(req);
    }

    fn deactivate(&mut self, req: DeactivateRequest) {
        lock(&self.log).deactivations.push(req);
    }

    fn query_active_contexts(&mut self) {
        lock(&self.log).context_queries += 1;
    }

    fn reregister_network(&mut self) {
        lock(&self.log).reregistrations += 1;
    }
}

// ─── Timers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TimerLog {
    pending: HashMap<TimerKind, (TimerToken, Duration)>,
    scheduled: Vec<(TimerToken, Duration)>,
    cancelled: Vec<TimerToken>,
}

/// Timers that only fire when the test says so.
#[derive(Debug, Clone, Default)]
pub struct ManualTimers {
    log: Arc<Mutex<TimerLog>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, kind: TimerKind) -> Option<(TimerToken, Duration)> {
        lock(&self.log).pending.get(&kind).copied()
    }

    /// Remove the pending timer of `kind` as if it had fired.
    pub fn take(&self, kind: TimerKind) -> Option<TimerToken> {
        lock(&self.log).pending.remove(&kind).map(|(t, _)| t)
    }

    /// Every schedule call, in order.
    pub fn scheduled(&self) -> Vec<(TimerToken, Duration)> {
        lock(&self.log).scheduled.clone()
    }

    /// Delays scheduled for `kind`, in order.
    pub fn delays(&self, kind: TimerKind) -> Vec<Duration> {
        lock(&self.log)
            .scheduled
            .iter()
            .filter(|(t, _)| t.kind == kind)
            .map(|(_, d)| *d)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<TimerToken> {
        lock(&self.log).cancelled.clone()
    }
}

impl TimerScheduler for ManualTimers {
    fn schedule(&mut self, token: TimerToken, after: Duration) {
        let mut log = lock(&self.log);
        log.pending.insert(token.kind, (token, after));
        log.scheduled.push((token, after));
    }

    fn cancel(&mut self, token: TimerToken) {
        let mut log = lock(&self.log);
        if log.pending.get(&token.kind).is_some_and(|(t, _)| *t == token) {
            log.pending.remove(&token.kind);
        }
        log.cancelled.push(token);
    }
}

// ─── Tables and Stores ──────────────────────────────────────────────────────

/// APN rows keyed by operator.
#[derive(Debug, Clone, Default)]
pub struct StaticApnTable {
    rows: Arc<Mutex<HashMap<String, Vec<ApnRow>>>>,
}

impl StaticApnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, operator: &str, rows: Vec<ApnRow>) {
        lock(&self.rows).insert(operator.to_string(), rows);
    }
}

impl ApnTable for StaticApnTable {
    fn rows_for_operator(&self, operator: &str) -> Vec<ApnRow> {
        lock(&self.rows).get(operator).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPrefs {
    preferred: Arc<Mutex<Option<i64>>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<i64> {
        *lock(&self.preferred)
    }

    pub fn set(&self, id: Option<i64>) {
        *lock(&self.preferred) = id;
    }
}

impl PreferenceStore for MemoryPrefs {
    fn load_preferred(&self) -> Option<i64> {
        self.get()
    }

    fn store_preferred(&mut self, id: Option<i64>) {
        self.set(id);
    }
}

/// Counter samples served in order. Once the script runs out the last
/// sample repeats; before the first push the counters are unreadable.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCounters {
    inner: Arc<Mutex<(VecDeque<TrafficSample>, Option<TrafficSample>)>>,
}

impl ScriptedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx_packets: u64, rx_packets: u64) {
        lock(&self.inner).0.push_back(TrafficSample {
            tx_packets,
            rx_packets,
        });
    }
}

impl TrafficCounters for ScriptedCounters {
    fn sample(&mut self) -> Option<TrafficSample> {
        let mut inner = lock(&self.inner);
        if let Some(next) = inner.0.pop_front() {
            inner.1 = Some(next);
        }
        inner.1
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

/// A supervisor wired to fakes, with a notification log.
pub struct Harness {
    pub sup: DataSessionSupervisor,
    pub radio: RecordingRadio,
    pub timers: ManualTimers,
    pub apn_table: StaticApnTable,
    pub prefs: MemoryPrefs,
    pub counters: ScriptedCounters,
    log: Arc<Mutex<Vec<Notification>>>,
}

impl Harness {
    pub fn new(cfg: SupervisorConfig) -> Self {
        let radio = RecordingRadio::new();
        let timers = ManualTimers::new();
        let apn_table = StaticApnTable::new();
        let prefs = MemoryPrefs::new();
        let counters = ScriptedCounters::new();
        let collab = Collaborators {
            radio: Box::new(radio.clone()),
            apn_table: Box::new(apn_table.clone()),
            counters: Box::new(counters.clone()),
            prefs: Box::new(prefs.clone()),
        };
        let mut sup = DataSessionSupervisor::new(cfg, collab, Box::new(timers.clone()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        sup.subscribe(move |n| lock(&sink).push(n.clone()));
        Self {
            sup,
            radio,
            timers,
            apn_table,
            prefs,
            counters,
            log,
        }
    }

    pub fn event(&mut self, event: Event) {
        self.sup.on_event(event);
    }

    /// Fire the pending timer of `kind`. Panics if none is armed.
    pub fn fire(&mut self, kind: TimerKind) {
        let token = self
            .timers
            .take(kind)
            .unwrap_or_else(|| panic!("no {kind:?} timer pending"));
        self.sup.on_event(Event::TimerFired(token));
    }

    /// Answer the latest activation request with success.
    pub fn complete_setup_ok(&mut self, cid: u32) {
        self.complete_setup(Ok(network_params(cid)));
    }

    pub fn complete_setup_err(&mut self, cause: FailCause) {
        self.complete_setup(Err(cause));
    }

    fn complete_setup(&mut self, result: Result<NetworkParams, FailCause>) {
        let req = self
            .radio
            .activations()
            .pop()
            .unwrap_or_else(|| panic!("no activation requested"));
        self.sup.on_event(Event::SetupComplete {
            slot: req.slot,
            generation: req.generation,
            result,
        });
    }

    /// Answer the latest deactivation request.
    pub fn complete_disconnect(&mut self, result: Result<(), FailCause>) {
        let req = self
            .radio
            .deactivations()
            .pop()
            .unwrap_or_else(|| panic!("no deactivation requested"));
        self.sup.on_event(Event::DisconnectDone {
            slot: req.slot,
            generation: req.generation,
            result,
        });
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.log).clone()
    }

    pub fn clear_notifications(&self) {
        lock(&self.log).clear();
    }

    pub fn transitions(&self) -> Vec<(SessionState, SessionState)> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::StateTransition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Reasons of the data-connection notifications, in order.
    pub fn reasons(&self) -> Vec<Reason> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::DataConnection(status) => Some(status.reason),
                _ => None,
            })
            .collect()
    }

    pub fn setup_failures(&self) -> Vec<FailCause> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::SetupFailed { cause, .. } => Some(cause),
                _ => None,
            })
            .collect()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::DataActivity { activity } => Some(activity),
                _ => None,
            })
            .collect()
    }
}
