//! # Data Session Supervisor
//!
//! Keeps one logical packet-data session aligned with attach, SIM, radio
//! power, roaming and user settings.
//!
//! ```text
//!            trySetup                 setup              ok
//!   IDLE ───────────────► SCANNING ─────────► INITING ───────► CONNECTED
//!    ▲                       ▲                  │ │                │
//!    │                       └──transient, more─┘ │ permanent /    │ lost context,
//!    │                                            │ exhausted      │ roaming, disable
//!    │             retry alarm                    ▼                ▼
//!    │◄──────────────────────────────────────── FAILED        DISCONNECTING
//!    └─────────────────────────── disconnect done ──────────────────┘
//! ```
//!
//! The supervisor is sans-IO. Commands go out through the collaborator
//! traits in [`collab`](crate::collab); completions and timer firings come
//! back through [`DataSessionSupervisor::on_event`]. Follow-up work the
//! supervisor posts to itself is queued and drained before `on_event`
//! returns, so each call leaves the machine quiescent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::apn::{ApnCatalog, ApnSetting, ApnType};
use crate::cause::FailCause;
use crate::collab::{
    ApnTable, Collaborators, PreferenceStore, RadioCommands, TimerScheduler, TrafficCounters,
};
use crate::config::SupervisorConfig;
use crate::error::{SlotError, SupervisorError};
use crate::event::{ContextInfo, Event, RadioFamily, Reason, TimerKind, TimerToken};
use crate::netstat::{NetStatPoller, Recovery};
use crate::notify::{Activity, Notification, ObserverId, Observers, SessionStatus};
use crate::retry::{
    LinearRetry, RetryPolicy, DEFAULT_DATA_RETRY_CONFIG, SECONDARY_DATA_RETRY_CONFIG,
};
use crate::slot::{ConnectionSlot, NetworkParams, SetupOutcome, SlotState};

// ─── State ──────────────────────────────────────────────────────────────────

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session and nothing in progress.
    #[default]
    Idle,
    /// Activation requested, waiting for the radio.
    Initing,
    /// Between candidate APNs.
    Scanning,
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Setup gave up; a retry alarm may be pending.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "IDLE",
            SessionState::Initing => "INITING",
            SessionState::Scanning => "SCANNING",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnecting => "DISCONNECTING",
            SessionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Answer to [`DataSessionSupervisor::request_capability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRequest {
    /// The current session already serves the capability.
    AlreadyActive,
    /// Setup for the capability is under way.
    Started,
    /// No APN of the current operator serves the capability.
    NotAvailable,
}

/// Point-in-time copy of the externally visible session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub requested: ApnType,
    pub active_apn: Option<ApnSetting>,
    pub network: Option<NetworkParams>,
    pub last_fail_cause: Option<FailCause>,
    pub slots: Vec<SlotState>,
    pub retry_attempt: u32,
    pub activity: Activity,
    pub data_connection_as_desired: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            requested: ApnType::Default,
            active_apn: None,
            network: None,
            last_fail_cause: None,
            slots: Vec::new(),
            retry_attempt: 0,
            activity: Activity::None,
            data_connection_as_desired: true,
        }
    }
}

impl SessionSnapshot {
    pub fn is_session_usable(&self, capability: ApnType) -> bool {
        usable(self.state, self.active_apn.as_ref(), capability)
    }

    pub fn active_network_info(&self, capability: ApnType) -> Option<&NetworkParams> {
        if self.active_apn.as_ref()?.can_handle(capability) {
            self.network.as_ref()
        } else {
            None
        }
    }
}

fn usable(state: SessionState, apn: Option<&ApnSetting>, capability: ApnType) -> bool {
    state == SessionState::Connected && apn.is_some_and(|a| a.can_handle(capability))
}

// ─── Supervisor ─────────────────────────────────────────────────────────────

pub struct DataSessionSupervisor {
    cfg: SupervisorConfig,
    state: SessionState,
    catalog: ApnCatalog,
    slots: Vec<ConnectionSlot>,
    waiting: VecDeque<ApnSetting>,
    active_apn: Option<ApnSetting>,
    active_slot: Option<usize>,
    requested: ApnType,
    enabled: HashSet<ApnType>,
    last_fail_cause: Option<FailCause>,

    // Inputs
    sim_operator: Option<String>,
    /// Last operator whose records loaded. Survives SIM removal.
    loaded_operator: Option<String>,
    attached: bool,
    no_auto_attach: bool,
    roaming: bool,
    data_roaming_allowed: bool,
    master_data_enabled: bool,
    ps_restricted: bool,
    desired_power: bool,
    radio_family: RadioFamily,
    in_voice_call: bool,
    concurrent_voice_data: bool,
    wifi_connected: bool,

    // Retry
    default_retry: RetryPolicy,
    secondary_retry: RetryPolicy,
    reregister_on_failure: bool,
    retry_reason: Reason,

    // Polling and timers
    netstat: NetStatPoller,
    pending_timers: HashMap<TimerKind, TimerToken>,
    next_timer_id: u64,

    deferred: VecDeque<Event>,
    radio: Box<dyn RadioCommands + Send>,
    apn_table: Box<dyn ApnTable + Send>,
    counters: Box<dyn TrafficCounters + Send>,
    prefs: Box<dyn PreferenceStore + Send>,
    timers: Box<dyn TimerScheduler>,
    observers: Observers,
}

impl DataSessionSupervisor {
    pub fn new(
        cfg: SupervisorConfig,
        collab: Collaborators,
        timers: Box<dyn TimerScheduler>,
    ) -> Self {
        let (default_retry, default_source) = RetryPolicy::from_chain(
            cfg.retry.default_spec.as_deref(),
            DEFAULT_DATA_RETRY_CONFIG,
            LinearRetry::DEFAULT,
            cfg.retry.seed,
        );
        let (secondary_retry, secondary_source) = RetryPolicy::from_chain(
            cfg.retry.secondary_spec.as_deref(),
            SECONDARY_DATA_RETRY_CONFIG,
            LinearRetry::SECONDARY,
            cfg.retry.seed.wrapping_add(1),
        );
        info!(
            default = ?default_source,
            secondary = ?secondary_source,
            pool_size = cfg.session.pool_size,
            "data session supervisor created"
        );

        let mut enabled = HashSet::new();
        if cfg.session.data_enabled_on_boot {
            enabled.insert(ApnType::Default);
        }
        let slots = (0..cfg.session.pool_size).map(ConnectionSlot::new).collect();

        Self {
            state: SessionState::Idle,
            catalog: ApnCatalog::new(),
            slots,
            waiting: VecDeque::new(),
            active_apn: None,
            active_slot: None,
            requested: ApnType::Default,
            enabled,
            last_fail_cause: None,
            sim_operator: None,
            loaded_operator: None,
            attached: false,
            no_auto_attach: !cfg.session.data_enabled_on_boot,
            roaming: false,
            data_roaming_allowed: cfg.session.data_roaming,
            master_data_enabled: true,
            ps_restricted: false,
            desired_power: true,
            radio_family: RadioFamily::Gsm,
            in_voice_call: false,
            concurrent_voice_data: true,
            wifi_connected: false,
            default_retry,
            secondary_retry,
            reregister_on_failure: false,
            retry_reason: Reason::Unspecified,
            netstat: NetStatPoller::new(cfg.netstat),
            pending_timers: HashMap::new(),
            next_timer_id: 0,
            deferred: VecDeque::new(),
            radio: collab.radio,
            apn_table: collab.apn_table,
            counters: collab.counters,
            prefs: collab.prefs,
            timers,
            observers: Observers::new(),
            cfg,
        }
    }

    // ── Public surface ──────────────────────────────────────────────────

    /// Process one event and everything it queues.
    pub fn on_event(&mut self, event: Event) {
        self.deferred.push_back(event);
        self.drain();
    }

    pub fn subscribe<F>(&mut self, f: F) -> ObserverId
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.observers.subscribe(f)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Enable a capability and bring up a session that serves it.
    pub fn request_capability(&mut self, capability: ApnType) -> CapabilityRequest {
        let answer = self.enable_capability(capability);
        self.drain();
        answer
    }

    /// Disable a capability. Returns false if it was not enabled.
    pub fn release_capability(&mut self, capability: ApnType) -> bool {
        let released = match self.disable_capability(capability) {
            Ok(released) => released,
            Err(e) => {
                error!(capability = %capability, error = %e, "release failed");
                true
            }
        };
        self.drain();
        released
    }

    pub fn is_session_usable(&self, capability: ApnType) -> bool {
        usable(self.state, self.active_apn.as_ref(), capability)
    }

    /// Network parameters of the session serving `capability`, if any.
    pub fn active_network_info(&self, capability: ApnType) -> Option<NetworkParams> {
        if !self.active_apn.as_ref()?.can_handle(capability) {
            return None;
        }
        let slot = self.slots.get(self.active_slot?)?;
        slot.params().cloned()
    }

    /// False only when every precondition for data holds and yet there is
    /// no connected session.
    pub fn is_data_connection_as_desired(&self) -> bool {
        if self.sim_operator.is_some()
            && self.attached
            && (!self.roaming || self.data_roaming_allowed)
            && !self.wifi_connected
            && !self.ps_restricted
        {
            return self.state == SessionState::Connected;
        }
        true
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn requested_capability(&self) -> ApnType {
        self.requested
    }

    pub fn active_apn(&self) -> Option<&ApnSetting> {
        self.active_apn.as_ref()
    }

    pub fn last_fail_cause(&self) -> Option<FailCause> {
        self.last_fail_cause
    }

    pub fn catalog(&self) -> &ApnCatalog {
        &self.catalog
    }

    pub fn slots(&self) -> &[ConnectionSlot] {
        &self.slots
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.active_retry()
    }

    /// Token of the pending timer of `kind`, if one is armed.
    pub fn pending_timer(&self, kind: TimerKind) -> Option<TimerToken> {
        self.pending_timers.get(&kind).copied()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            requested: self.requested,
            active_apn: self.active_apn.clone(),
            network: self
                .active_slot
                .and_then(|i| self.slots.get(i))
                .and_then(|s| s.params().cloned()),
            last_fail_cause: self.last_fail_cause,
            slots: self.slots.iter().map(|s| s.state()).collect(),
            retry_attempt: self.active_retry().attempt(),
            activity: self.netstat.activity(),
            data_connection_as_desired: self.is_data_connection_as_desired(),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn drain(&mut self) {
        while let Some(event) = self.deferred.pop_front() {
            let name = event.name();
            if let Err(e) = self.dispatch(event) {
                error!(event = name, state = %self.state, error = %e, "event handling failed");
            }
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<(), SupervisorError> {
        match event {
            Event::Attached => {
                self.attached = true;
                self.on_attached()?;
            }
            Event::Detached => {
                self.attached = false;
                self.stop_netstat_poll();
                self.notify_data_connection(Reason::GprsDetached);
            }
            Event::SimReady { operator } => self.on_records_loaded(operator)?,
            Event::SimNotReady => {
                self.sim_operator = None;
                self.catalog.clear();
                self.forget_retry_history();
                if self.state != SessionState::Idle {
                    self.clean_up(true, Reason::Unspecified)?;
                }
            }
            Event::RoamingOn => {
                self.roaming = true;
                if self.data_roaming_allowed {
                    self.try_setup(Reason::RoamingOn)?;
                } else {
                    debug!("tearing down data on roaming");
                    self.clean_up(true, Reason::RoamingOn)?;
                }
            }
            Event::RoamingOff => {
                self.roaming = false;
                self.try_setup(Reason::RoamingOff)?;
            }
            Event::RadioAvailable => {
                if self.state != SessionState::Idle {
                    self.clean_up(true, Reason::Unspecified)?;
                }
            }
            Event::RadioOffOrUnavailable => {
                self.forget_retry_history();
                debug!("radio off, cleaning up all connections");
                self.clean_up(false, Reason::RadioTurnedOff)?;
            }
            Event::DesiredPower(on) => {
                self.desired_power = on;
                if on {
                    self.try_setup(Reason::Unspecified)?;
                }
            }
            Event::RadioFamilyChanged(family) => self.radio_family = family,
            Event::PsRestrictEnabled => {
                self.stop_netstat_poll();
                self.ps_restricted = true;
            }
            Event::PsRestrictDisabled => {
                self.ps_restricted = false;
                if self.state == SessionState::Connected {
                    self.start_netstat_poll();
                } else {
                    if self.state == SessionState::Failed {
                        self.clean_up(false, Reason::PsRestrictDisabled)?;
                        self.forget_retry_history();
                    }
                    self.try_setup(Reason::PsRestrictDisabled)?;
                }
            }
            Event::VoiceCallStarted => {
                self.in_voice_call = true;
                if self.state == SessionState::Connected && !self.concurrent_voice_data {
                    self.stop_netstat_poll();
                    self.notify_data_connection(Reason::VoiceCallStarted);
                }
            }
            Event::VoiceCallEnded => {
                self.in_voice_call = false;
                if self.state == SessionState::Connected {
                    if !self.concurrent_voice_data {
                        self.start_netstat_poll();
                        self.notify_data_connection(Reason::VoiceCallEnded);
                    } else {
                        self.netstat.reset_stats();
                    }
                } else {
                    self.forget_retry_history();
                    self.try_setup(Reason::VoiceCallEnded)?;
                }
            }
            Event::ConcurrentVoiceAndData(on) => self.concurrent_voice_data = on,
            Event::ScreenOn => self.on_screen(true),
            Event::ScreenOff => self.on_screen(false),
            Event::WifiConnected(on) => self.wifi_connected = on,
            Event::ApnTableChanged => self.on_apn_changed()?,
            Event::DataRoamingAllowed(allowed) => {
                self.data_roaming_allowed = allowed;
                if self.roaming {
                    if allowed {
                        self.try_setup(Reason::RoamingOn)?;
                    } else if self.state != SessionState::Idle {
                        self.clean_up(true, Reason::RoamingOn)?;
                    }
                }
            }
            Event::MasterDataEnabled(on) => {
                self.master_data_enabled = on;
                if on {
                    self.try_setup(Reason::DataEnabled)?;
                } else if self.state != SessionState::Idle {
                    self.clean_up(true, Reason::DataDisabled)?;
                }
            }
            Event::SetupComplete {
                slot,
                generation,
                result,
            } => self.on_setup_complete(slot, generation, result)?,
            Event::DisconnectDone {
                slot,
                generation,
                result,
            } => self.on_disconnect_done(slot, generation, result)?,
            Event::ContextList { contexts, explicit } => {
                self.on_context_list(&contexts, explicit)?
            }
            Event::TimerFired(token) => self.on_timer(token)?,
            Event::TrySetup(reason) => {
                self.try_setup(reason)?;
            }
            Event::StartRecovery => self.do_recovery()?,
        }
        Ok(())
    }

    // ── Setup ───────────────────────────────────────────────────────────

    fn data_allowed(&self) -> bool {
        !self.enabled.is_empty()
            && (!self.roaming || self.data_roaming_allowed)
            && self.master_data_enabled
    }

    fn try_setup(&mut self, reason: Reason) -> Result<bool, SupervisorError> {
        debug!(reason = %reason, state = %self.state, "trySetup");

        let ready = matches!(self.state, SessionState::Idle | SessionState::Scanning)
            && (self.attached || self.no_auto_attach)
            && self.sim_operator.is_some()
            && self.data_allowed()
            && !self.ps_restricted
            && self.desired_power;
        if !ready {
            debug!(
                state = %self.state,
                attached = self.attached,
                sim_loaded = self.sim_operator.is_some(),
                data_allowed = self.data_allowed(),
                roaming = self.roaming,
                ps_restricted = self.ps_restricted,
                desired_power = self.desired_power,
                master = self.master_data_enabled,
                "not ready for data"
            );
            return Ok(false);
        }

        if self.state == SessionState::Idle {
            self.waiting = self.catalog.build_waiting(self.requested).into();
            if self.waiting.is_empty() {
                debug!(capability = %self.requested, "no APN found");
                self.report_failure(FailCause::MissingUnknownApn, reason);
                return Ok(false);
            }
            self.set_state(SessionState::Scanning);
        }
        self.setup_data(reason)
    }

    fn setup_data(&mut self, reason: Reason) -> Result<bool, SupervisorError> {
        let Some(apn) = self.waiting.front().cloned() else {
            return Ok(false);
        };
        let Some(idx) = self.slots.iter().position(ConnectionSlot::is_inactive) else {
            warn!(apn = %apn, "no free packet context");
            self.last_fail_cause = Some(FailCause::NoFreeSlot);
            return Ok(false);
        };

        self.cancel_timer(TimerKind::ApnDelay);
        self.active_apn = Some(apn.clone());
        self.active_slot = Some(idx);
        self.set_state(SessionState::Initing);
        self.slots[idx].connect(apn, reason, self.radio.as_mut())?;
        self.notify_data_connection(reason);
        Ok(true)
    }

    fn on_setup_complete(
        &mut self,
        idx: usize,
        generation: u64,
        result: Result<NetworkParams, FailCause>,
    ) -> Result<(), SupervisorError> {
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or(SlotError::UnknownSlot(idx))?;
        let reason = slot.reason();
        match slot.on_setup_complete(generation, result, self.radio.as_mut()) {
            SetupOutcome::Stale => Ok(()),
            SetupOutcome::TornDown => self.after_slot_released(reason),
            SetupOutcome::Connected => {
                if self.active_slot != Some(idx) || self.state != SessionState::Initing {
                    return Err(SupervisorError::Invariant(format!(
                        "slot {idx} activated while {} (active slot {:?})",
                        self.state, self.active_slot
                    )));
                }
                self.on_setup_success(reason);
                Ok(())
            }
            SetupOutcome::Failed(cause) => self.on_setup_failed(cause, reason),
        }
    }

    fn on_setup_success(&mut self, reason: Reason) {
        if let Some(apn) = &self.active_apn {
            if apn.can_handle(ApnType::Default) && self.catalog.preferred().is_none() {
                info!(apn = %apn, "recording preferred APN");
                self.catalog.set_preferred(apn.clone());
                self.prefs.store_preferred(Some(apn.id));
            }
        }
        self.last_fail_cause = None;
        self.set_state(SessionState::Connected);
        self.notify_data_connection(reason);
        self.start_netstat_poll();
        self.start_context_poll();
        self.forget_retry_history();
        self.cancel_timer(TimerKind::Reconnect);
    }

    fn on_setup_failed(&mut self, cause: FailCause, reason: Reason) -> Result<(), SupervisorError> {
        self.last_fail_cause = Some(cause);
        let apn = self.active_apn.take();
        self.active_slot = None;
        if cause.is_event_loggable() {
            warn!(
                cause = ?cause,
                code = ?cause.code(),
                apn = ?apn.as_ref().map(|a| a.apn.as_str()),
                "data setup failed"
            );
        } else {
            debug!(cause = ?cause, "data setup failed");
        }

        if cause.is_permanent_fail() {
            self.report_failure(cause, reason);
            if self.requested != ApnType::Default {
                self.notify_data_connection(Reason::ApnFailed);
                self.disable_capability(self.requested)?;
            }
            return Ok(());
        }

        self.waiting.pop_front();
        if self.waiting.is_empty() {
            self.set_state(SessionState::Failed);
            self.reconnect_after_fail(cause, reason)
        } else {
            self.set_state(SessionState::Scanning);
            self.retry_reason = reason;
            self.arm_timer(TimerKind::ApnDelay, self.cfg.session.apn_delay);
            Ok(())
        }
    }

    fn reconnect_after_fail(&mut self, cause: FailCause, reason: Reason) -> Result<(), SupervisorError> {
        if self.state != SessionState::Failed {
            return Ok(());
        }
        if !self.active_retry().is_retry_needed() {
            if self.requested != ApnType::Default {
                self.notify_data_connection(Reason::ApnFailed);
                self.disable_capability(self.requested)?;
                return Ok(());
            }
            if self.reregister_on_failure {
                info!("retries exhausted after re-registration, retrying forever");
                self.active_retry_mut().retry_forever_using_last_timeout();
            } else {
                info!("data setup failed, re-registering with the network");
                self.reregister_on_failure = true;
                self.radio.reregister_network();
                self.active_retry_mut().reset();
                return Ok(());
            }
        }

        let delay = self.active_retry_mut().next_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.active_retry().attempt(),
            "scheduling next setup attempt"
        );
        self.retry_reason = reason;
        self.arm_timer(TimerKind::Reconnect, delay);
        self.active_retry_mut().increase_attempt();

        if cause == FailCause::Unknown {
            debug!("not posting failure notification for transient error");
        } else {
            self.observers
                .notify(&Notification::SetupFailed { reason, cause });
        }
        Ok(())
    }

    /// Move to FAILED and surface the cause.
    fn report_failure(&mut self, cause: FailCause, reason: Reason) {
        self.last_fail_cause = Some(cause);
        self.set_state(SessionState::Failed);
        if cause != FailCause::Unknown {
            self.observers
                .notify(&Notification::SetupFailed { reason, cause });
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Cancel pending retries and release every slot. With `tear_down` the
    /// contexts are deactivated over the air and the session goes IDLE once
    /// the radio confirms; otherwise slots are cleared locally and the
    /// session goes IDLE at once without a new setup attempt.
    fn clean_up(&mut self, tear_down: bool, reason: Reason) -> Result<(), SupervisorError> {
        debug!(tear_down, reason = %reason, state = %self.state, "clean up connection");
        self.cancel_timer(TimerKind::Reconnect);
        self.cancel_timer(TimerKind::ApnDelay);
        self.set_state(SessionState::Disconnecting);

        let mut pending = false;
        for slot in self.slots.iter_mut() {
            if tear_down {
                match slot.state() {
                    SlotState::Active | SlotState::Activating => {
                        slot.disconnect(reason, self.radio.as_mut())?;
                        pending = true;
                    }
                    SlotState::Deactivating => pending = true,
                    SlotState::Inactive => {}
                }
            } else {
                slot.clear_settings();
            }
        }
        self.stop_netstat_poll();
        self.cancel_timer(TimerKind::ContextPoll);

        if !tear_down {
            self.finish_teardown(reason);
        } else if !pending {
            self.finish_teardown(reason);
            if reason.retries_after_disconnect() {
                self.deferred.push_back(Event::TrySetup(reason));
            }
        }
        Ok(())
    }

    fn finish_teardown(&mut self, reason: Reason) {
        self.set_state(SessionState::Idle);
        self.notify_data_connection(reason);
        self.active_apn = None;
        self.active_slot = None;
    }

    fn on_disconnect_done(
        &mut self,
        idx: usize,
        generation: u64,
        result: Result<(), FailCause>,
    ) -> Result<(), SupervisorError> {
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or(SlotError::UnknownSlot(idx))?;
        let reason = slot.reason();
        if !slot.on_disconnect_done(generation, result) {
            return Ok(());
        }
        self.after_slot_released(reason)
    }

    fn after_slot_released(&mut self, reason: Reason) -> Result<(), SupervisorError> {
        if self
            .slots
            .iter()
            .any(|s| s.state() == SlotState::Deactivating)
        {
            return Ok(());
        }
        if self.state != SessionState::Disconnecting {
            debug!(state = %self.state, "slot released outside teardown");
            return Ok(());
        }
        debug!(reason = %reason, "disconnect done");
        self.finish_teardown(reason);
        if reason.retries_after_disconnect() {
            self.try_setup(reason)?;
        }
        Ok(())
    }

    // ── Network status ──────────────────────────────────────────────────

    fn on_attached(&mut self) -> Result<(), SupervisorError> {
        if self.state == SessionState::Connected {
            self.start_netstat_poll();
            self.notify_data_connection(Reason::GprsAttached);
        } else {
            if self.state == SessionState::Failed {
                self.clean_up(false, Reason::GprsAttached)?;
                self.active_retry_mut().reset();
            }
            self.try_setup(Reason::GprsAttached)?;
        }
        Ok(())
    }

    fn on_records_loaded(&mut self, operator: String) -> Result<(), SupervisorError> {
        if self.sim_operator.as_deref() != Some(operator.as_str()) {
            info!(operator = %operator, "SIM operator loaded");
            self.default_retry.reset();
            self.default_retry.clear_retry_forever();
            self.secondary_retry.reset();
            self.secondary_retry.clear_retry_forever();
            self.reregister_on_failure = false;
        }
        if let Some(prev) = self
            .loaded_operator
            .as_deref()
            .filter(|prev| *prev != operator)
        {
            info!(from = %prev, to = %operator, "operator changed, dropping preferred APN");
            self.catalog.clear_preferred();
            self.prefs.store_preferred(None);
        }
        self.loaded_operator = Some(operator.clone());
        self.sim_operator = Some(operator);
        self.rebuild_catalog();
        if self.state == SessionState::Failed {
            self.clean_up(false, Reason::SimLoaded)?;
        }
        self.deferred.push_back(Event::TrySetup(Reason::SimLoaded));
        Ok(())
    }

    fn rebuild_catalog(&mut self) {
        let Some(operator) = self.sim_operator.clone() else {
            self.catalog.clear();
            return;
        };
        let rows = self.apn_table.rows_for_operator(&operator);
        let outcome = self.catalog.rebuild(&operator, &rows);
        if outcome.preferred_cleared {
            self.prefs.store_preferred(None);
        }
        if self.catalog.preferred().is_none() {
            if let Some(id) = self.prefs.load_preferred() {
                if !self.catalog.restore_preferred(id) {
                    info!(id, operator = %operator, "stored preferred APN does not resolve, clearing");
                    self.prefs.store_preferred(None);
                }
            }
        }
    }

    fn on_apn_changed(&mut self) -> Result<(), SupervisorError> {
        let in_progress = !matches!(self.state, SessionState::Idle | SessionState::Failed);
        self.rebuild_catalog();
        if !self.preferred_apn_changed() || self.state == SessionState::Disconnecting {
            return Ok(());
        }
        self.clean_up(in_progress, Reason::ApnChanged)?;
        if !in_progress {
            self.forget_retry_history();
            self.try_setup(Reason::ApnChanged)?;
        }
        Ok(())
    }

    /// The APN the session would use now differs from the one in use.
    fn preferred_apn_changed(&self) -> bool {
        let changed = match (self.catalog.preferred(), &self.active_apn) {
            (Some(preferred), Some(active)) => !preferred.same_deployment(active),
            _ => true,
        };
        debug!(changed, "preferred APN check");
        changed
    }

    fn on_context_list(&mut self, contexts: &[ContextInfo], explicit: bool) -> Result<(), SupervisorError> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        let Some(cid) = self
            .active_slot
            .and_then(|i| self.slots.get(i))
            .and_then(|s| s.params())
            .map(|p| p.cid)
        else {
            return Ok(());
        };

        if !contexts.iter().any(|c| c.cid == cid) {
            info!(cid, "packet context dropped, reconnecting");
            return self.tear_down_lost_context();
        }
        if !contexts.iter().any(|c| c.cid == cid && c.active) {
            if explicit {
                info!(cid, "packet context inactive, reconnecting");
                return self.tear_down_lost_context();
            }
            debug!(cid, "context reported inactive, confirming");
            self.radio.query_active_contexts();
        }
        Ok(())
    }

    fn tear_down_lost_context(&mut self) -> Result<(), SupervisorError> {
        let reason = match self.radio_family {
            RadioFamily::Gsm => Reason::ContextLost,
            RadioFamily::Cdma => {
                info!("data reconnect disabled, radio technology changed");
                Reason::RadioTechnologyChanged
            }
        };
        self.clean_up(true, reason)
    }

    // ── Capabilities ────────────────────────────────────────────────────

    fn enable_capability(&mut self, capability: ApnType) -> CapabilityRequest {
        if capability == ApnType::All || !self.catalog.is_type_available(capability) {
            debug!(capability = %capability, "capability not available");
            return CapabilityRequest::NotAvailable;
        }
        if self.enabled.contains(&capability) {
            return if self.is_session_usable(capability) {
                CapabilityRequest::AlreadyActive
            } else {
                CapabilityRequest::Started
            };
        }
        self.enabled.insert(capability);
        let serves = self
            .active_apn
            .as_ref()
            .is_some_and(|a| a.can_handle(capability));
        if !serves {
            self.requested = capability;
            if let Err(e) = self.switch_capability() {
                error!(capability = %capability, error = %e, "capability switch failed");
            }
        }
        CapabilityRequest::Started
    }

    fn disable_capability(&mut self, capability: ApnType) -> Result<bool, SupervisorError> {
        if !self.enabled.remove(&capability) {
            return Ok(false);
        }
        info!(capability = %capability, "capability disabled");
        if self.enabled.is_empty() {
            if self.state != SessionState::Idle {
                self.clean_up(true, Reason::DataDisabled)?;
            }
        } else if self.enabled.contains(&ApnType::Default)
            && !self
                .active_apn
                .as_ref()
                .is_some_and(|a| a.can_handle(ApnType::Default))
        {
            self.requested = ApnType::Default;
            self.switch_capability()?;
        }
        Ok(true)
    }

    /// The requested capability changed: switch retry policy and restart.
    fn switch_capability(&mut self) -> Result<(), SupervisorError> {
        info!(capability = %self.requested, "switching requested capability");
        self.active_retry_mut().reset();
        self.clean_up(true, Reason::ApnSwitched)
    }

    // ── Timers ──────────────────────────────────────────────────────────

    fn arm_timer(&mut self, kind: TimerKind, after: Duration) {
        self.cancel_timer(kind);
        self.next_timer_id += 1;
        let token = TimerToken {
            kind,
            id: self.next_timer_id,
        };
        self.pending_timers.insert(kind, token);
        self.timers.schedule(token, after);
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(token) = self.pending_timers.remove(&kind) {
            self.timers.cancel(token);
        }
    }

    fn on_timer(&mut self, token: TimerToken) -> Result<(), SupervisorError> {
        if self.pending_timers.get(&token.kind) != Some(&token) {
            debug!(kind = ?token.kind, id = token.id, "ignoring superseded timer");
            return Ok(());
        }
        self.pending_timers.remove(&token.kind);
        match token.kind {
            TimerKind::Reconnect => {
                debug!(state = %self.state, "reconnect alarm");
                if self.state == SessionState::Failed {
                    self.clean_up(false, self.retry_reason)?;
                }
                self.try_setup(Reason::RetryAlarm)?;
            }
            TimerKind::ApnDelay => {
                self.try_setup(self.retry_reason)?;
            }
            TimerKind::NetStatPoll => self.poll_netstat(),
            TimerKind::ContextPoll => {
                if self.state == SessionState::Connected {
                    self.radio.query_active_contexts();
                    self.arm_timer(TimerKind::ContextPoll, self.cfg.session.context_poll);
                }
            }
        }
        Ok(())
    }

    // ── Stall detection ─────────────────────────────────────────────────

    fn start_netstat_poll(&mut self) {
        if self.state == SessionState::Connected && self.netstat.start() {
            self.poll_netstat();
        }
    }

    /// Poll interval depends on the screen; restart to pick it up.
    fn on_screen(&mut self, on: bool) {
        self.netstat.set_screen_on(on);
        if self.state == SessionState::Connected {
            self.stop_netstat_poll();
            self.start_netstat_poll();
        }
    }

    fn stop_netstat_poll(&mut self) {
        self.netstat.stop();
        self.cancel_timer(TimerKind::NetStatPoll);
    }

    fn start_context_poll(&mut self) {
        self.arm_timer(TimerKind::ContextPoll, self.cfg.session.context_poll);
    }

    fn poll_netstat(&mut self) {
        if !self.netstat.is_enabled() {
            return;
        }
        let sample = self.counters.sample();
        let report = self.netstat.poll(sample, !self.in_voice_call);
        if report.activity_changed {
            self.observers.notify(&Notification::DataActivity {
                activity: report.activity,
            });
        }
        if report.stalled {
            self.cancel_timer(TimerKind::NetStatPoll);
            self.deferred.push_back(Event::StartRecovery);
        } else {
            self.arm_timer(TimerKind::NetStatPoll, self.netstat.interval());
        }
    }

    fn do_recovery(&mut self) -> Result<(), SupervisorError> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        match self.netstat.escalate() {
            Recovery::Reconnect => {
                info!(reset_count = self.netstat.reset_count(), "data stall, resetting packet context");
                self.clean_up(true, Reason::PdpReset)?;
            }
            Recovery::Reregister => {
                info!("data stall persists, re-registering with the network");
                self.radio.reregister_network();
                self.start_netstat_poll();
            }
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn active_retry(&self) -> &RetryPolicy {
        if self.requested == ApnType::Default {
            &self.default_retry
        } else {
            &self.secondary_retry
        }
    }

    fn active_retry_mut(&mut self) -> &mut RetryPolicy {
        if self.requested == ApnType::Default {
            &mut self.default_retry
        } else {
            &mut self.secondary_retry
        }
    }

    /// Restart the retry sequence from the first delay and allow one more
    /// re-registration on exhaustion.
    fn forget_retry_history(&mut self) {
        let retry = self.active_retry_mut();
        retry.reset();
        retry.clear_retry_forever();
        self.reregister_on_failure = false;
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "session state");
            let from = self.state;
            self.state = next;
            self.observers
                .notify(&Notification::StateTransition { from, to: next });
        }
        if next == SessionState::Failed {
            self.waiting.clear();
        }
    }

    fn notify_data_connection(&mut self, reason: Reason) {
        let status = SessionStatus {
            reason,
            state: self.state,
            apn_types: self
                .active_apn
                .as_ref()
                .map(|a| a.types.clone())
                .unwrap_or_else(|| vec![ApnType::Default]),
            apn: self.active_apn.as_ref().map(|a| a.apn.clone()),
            network: self
                .active_slot
                .and_then(|i| self.slots.get(i))
                .and_then(|s| s.params().cloned()),
        };
        self.observers.notify(&Notification::DataConnection(status));
    }
}

impl fmt::Debug for DataSessionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSessionSupervisor")
            .field("state", &self.state)
            .field("requested", &self.requested)
            .field("active_apn", &self.active_apn)
            .field("active_slot", &self.active_slot)
            .field("waiting", &self.waiting.len())
            .field("last_fail_cause", &self.last_fail_cause)
            .finish_non_exhaustive()
    }
}
