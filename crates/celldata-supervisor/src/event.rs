//! Inbound events and the vocabulary they carry.
//!
//! Everything the supervisor reacts to arrives as an [`Event`]: status
//! changes from the network side, settings toggles, command completions and
//! timer firings. Completions and timers re-enter the same queue as
//! external events.

use std::fmt;

use serde::Serialize;

use crate::cause::FailCause;
use crate::slot::NetworkParams;

// ─── Timers ─────────────────────────────────────────────────────────────────

/// What a timer is for. At most one timer of each kind is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Delayed retry after setup failure.
    Reconnect,
    /// Pause before trying the next waiting APN.
    ApnDelay,
    /// Traffic counter sampling.
    NetStatPoll,
    /// Periodic active-context query.
    ContextPoll,
}

/// Identity of one timer registration. A fired token that is no longer the
/// pending one for its kind is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub id: u64,
}

// ─── Reasons ────────────────────────────────────────────────────────────────

/// Why a setup or teardown happened. Carried through notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    GprsAttached,
    GprsDetached,
    SimLoaded,
    RoamingOn,
    RoamingOff,
    ApnChanged,
    ApnSwitched,
    ApnFailed,
    RadioTurnedOff,
    RadioTechnologyChanged,
    PdpReset,
    PsRestrictDisabled,
    VoiceCallStarted,
    VoiceCallEnded,
    DataEnabled,
    DataDisabled,
    RetryAlarm,
    ContextLost,
    Unspecified,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::GprsAttached => "gprsAttached",
            Reason::GprsDetached => "gprsDetached",
            Reason::SimLoaded => "simLoaded",
            Reason::RoamingOn => "roamingOn",
            Reason::RoamingOff => "roamingOff",
            Reason::ApnChanged => "apnChanged",
            Reason::ApnSwitched => "apnSwitched",
            Reason::ApnFailed => "apnFailed",
            Reason::RadioTurnedOff => "radioTurnedOff",
            Reason::RadioTechnologyChanged => "radioTechnologyChanged",
            Reason::PdpReset => "pdpReset",
            Reason::PsRestrictDisabled => "psRestrictDisabled",
            Reason::VoiceCallStarted => "2GVoiceCallStarted",
            Reason::VoiceCallEnded => "2GVoiceCallEnded",
            Reason::DataEnabled => "dataEnabled",
            Reason::DataDisabled => "dataDisabled",
            Reason::RetryAlarm => "retryAlarm",
            Reason::ContextLost => "contextLost",
            Reason::Unspecified => "unspecified",
        }
    }

    /// Whether a completed teardown for this reason should be followed by a
    /// new setup attempt.
    pub fn retries_after_disconnect(&self) -> bool {
        !matches!(
            self,
            Reason::RadioTurnedOff | Reason::RadioTechnologyChanged | Reason::DataDisabled
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Radio Context ──────────────────────────────────────────────────────────

/// Radio access family the network is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioFamily {
    #[default]
    Gsm,
    Cdma,
}

/// One entry of the radio's active-context list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInfo {
    pub cid: u32,
    pub active: bool,
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Network status
    Attached,
    Detached,
    SimReady { operator: String },
    SimNotReady,
    RoamingOn,
    RoamingOff,
    RadioAvailable,
    RadioOffOrUnavailable,
    DesiredPower(bool),
    RadioFamilyChanged(RadioFamily),
    PsRestrictEnabled,
    PsRestrictDisabled,

    // Device status
    VoiceCallStarted,
    VoiceCallEnded,
    ConcurrentVoiceAndData(bool),
    ScreenOn,
    ScreenOff,
    WifiConnected(bool),

    // Settings
    ApnTableChanged,
    DataRoamingAllowed(bool),
    MasterDataEnabled(bool),

    // Command completions
    SetupComplete {
        slot: usize,
        generation: u64,
        result: Result<NetworkParams, FailCause>,
    },
    DisconnectDone {
        slot: usize,
        generation: u64,
        result: Result<(), FailCause>,
    },
    /// Active-context list. `explicit` is true when it answers our own
    /// query rather than arriving unsolicited.
    ContextList {
        contexts: Vec<ContextInfo>,
        explicit: bool,
    },

    TimerFired(TimerToken),

    // Posted by the supervisor itself
    TrySetup(Reason),
    StartRecovery,
}

impl Event {
    /// Short name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Attached => "attached",
            Event::Detached => "detached",
            Event::SimReady { .. } => "sim_ready",
            Event::SimNotReady => "sim_not_ready",
            Event::RoamingOn => "roaming_on",
            Event::RoamingOff => "roaming_off",
            Event::RadioAvailable => "radio_available",
            Event::RadioOffOrUnavailable => "radio_off",
            Event::DesiredPower(_) => "desired_power",
            Event::RadioFamilyChanged(_) => "radio_family",
            Event::PsRestrictEnabled => "ps_restrict_enabled",
            Event::PsRestrictDisabled => "ps_restrict_disabled",
            Event::VoiceCallStarted => "voice_call_started",
            Event::VoiceCallEnded => "voice_call_ended",
            Event::ConcurrentVoiceAndData(_) => "concurrent_voice_data",
            Event::ScreenOn => "screen_on",
            Event::ScreenOff => "screen_off",
            Event::WifiConnected(_) => "wifi",
            Event::ApnTableChanged => "apn_table_changed",
            Event::DataRoamingAllowed(_) => "data_roaming",
            Event::MasterDataEnabled(_) => "master_data",
            Event::SetupComplete { .. } => "setup_complete",
            Event::DisconnectDone { .. } => "disconnect_done",
            Event::ContextList { .. } => "context_list",
            Event::TimerFired(_) => "timer",
            Event::TrySetup(_) => "try_setup",
            Event::StartRecovery => "start_recovery",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_off_reasons_suppress_retry() {
        assert!(!Reason::RadioTurnedOff.retries_after_disconnect());
        assert!(!Reason::RadioTechnologyChanged.retries_after_disconnect());
        assert!(!Reason::DataDisabled.retries_after_disconnect());
        assert!(Reason::PdpReset.retries_after_disconnect());
        assert!(Reason::ContextLost.retries_after_disconnect());
        assert!(Reason::ApnSwitched.retries_after_disconnect());
    }

    #[test]
    fn reason_display_matches_wire_names() {
        assert_eq!(Reason::GprsAttached.to_string(), "gprsAttached");
        assert_eq!(Reason::VoiceCallEnded.to_string(), "2GVoiceCallEnded");
    }
}
