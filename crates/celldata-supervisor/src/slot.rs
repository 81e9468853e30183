//! # Connection Slot
//!
//! One packet-context resource of the bounded pool.
//!
//! ```text
//!   Inactive ──connect──► Activating ──ok──► Active
//!      ▲                     │  │              │
//!      │◄────────fail────────┘  │disconnect    │disconnect
//!      │                        ▼              ▼
//!      └──────done────────── Deactivating ◄────┘
//! ```
//!
//! Every `connect` bumps the slot's generation. Completions carry the
//! generation they were issued under; a completion for a generation the
//! slot has moved past is stale. A stale successful activation is torn
//! down on arrival so no network context is leaked.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::apn::ApnSetting;
use crate::cause::FailCause;
use crate::collab::{ActivateRequest, DeactivateRequest, RadioCommands};
use crate::error::SlotError;
use crate::event::Reason;

/// Slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Inactive => "inactive",
            SlotState::Activating => "activating",
            SlotState::Active => "active",
            SlotState::Deactivating => "deactivating",
        };
        f.write_str(s)
    }
}

/// Network parameters of an active packet context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkParams {
    pub interface: String,
    pub address: IpAddr,
    pub gateway: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub cid: u32,
}

impl NetworkParams {
    /// Drop unspecified (`0.0.0.0` / `::`) DNS entries.
    pub fn without_unspecified_dns(mut self) -> Self {
        self.dns.retain(|d| !d.is_unspecified());
        self
    }
}

/// What a setup completion did to the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Activating → Active.
    Connected,
    /// Activating → Inactive.
    Failed(FailCause),
    /// The slot was already being torn down and is now Inactive.
    TornDown,
    /// Completion did not belong to the current attempt.
    Stale,
}

#[derive(Debug, Clone)]
pub struct ConnectionSlot {
    index: usize,
    state: SlotState,
    generation: u64,
    apn: Option<ApnSetting>,
    params: Option<NetworkParams>,
    reason: Reason,
    /// Disconnect requested while activating; teardown goes out once the
    /// activation reports back.
    teardown_pending: bool,
}

impl ConnectionSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Inactive,
            generation: 0,
            apn: None,
            params: None,
            reason: Reason::Unspecified,
            teardown_pending: false,
        }
    }

    /// Start activating `apn`. Returns the generation the completion must
    /// carry.
    pub fn connect(
        &mut self,
        apn: ApnSetting,
        reason: Reason,
        radio: &mut dyn RadioCommands,
    ) -> Result<u64, SlotError> {
        if self.state != SlotState::Inactive {
            return Err(self.invalid("connect"));
        }
        self.generation += 1;
        self.state = SlotState::Activating;
        self.reason = reason;
        self.teardown_pending = false;
        self.apn = Some(apn.clone());
        debug!(slot = self.index, generation = self.generation, apn = %apn, "activating");
        radio.activate(ActivateRequest {
            slot: self.index,
            generation: self.generation,
            apn,
            reason,
        });
        Ok(self.generation)
    }

    /// Apply an activation result.
    pub fn on_setup_complete(
        &mut self,
        generation: u64,
        result: Result<NetworkParams, FailCause>,
        radio: &mut dyn RadioCommands,
    ) -> SetupOutcome {
        let current = generation == self.generation;
        match (self.state, current) {
            (SlotState::Activating, true) => match result {
                Ok(params) => {
                    debug!(slot = self.index, cid = params.cid, iface = %params.interface, "activated");
                    self.params = Some(params.without_unspecified_dns());
                    self.state = SlotState::Active;
                    SetupOutcome::Connected
                }
                Err(cause) => {
                    debug!(slot = self.index, cause = ?cause, "activation failed");
                    self.reset();
                    SetupOutcome::Failed(cause)
                }
            },
            (SlotState::Deactivating, true) if self.teardown_pending => {
                self.teardown_pending = false;
                match result {
                    Ok(params) => {
                        debug!(slot = self.index, cid = params.cid, "activated during teardown, deactivating");
                        radio.deactivate(DeactivateRequest {
                            slot: self.index,
                            generation: self.generation,
                            cid: params.cid,
                            reason: self.reason,
                        });
                        self.params = Some(params);
                        SetupOutcome::Stale
                    }
                    Err(_) => {
                        self.reset();
                        SetupOutcome::TornDown
                    }
                }
            }
            _ => {
                if let Ok(params) = result {
                    warn!(
                        slot = self.index,
                        generation,
                        cid = params.cid,
                        "late activation for released slot, deactivating"
                    );
                    radio.deactivate(DeactivateRequest {
                        slot: self.index,
                        generation,
                        cid: params.cid,
                        reason: Reason::Unspecified,
                    });
                } else {
                    debug!(slot = self.index, generation, "ignoring stale activation failure");
                }
                SetupOutcome::Stale
            }
        }
    }

    /// Start tearing the context down.
    pub fn disconnect(
        &mut self,
        reason: Reason,
        radio: &mut dyn RadioCommands,
    ) -> Result<(), SlotError> {
        match self.state {
            SlotState::Active => {
                let cid = self.params.as_ref().map(|p| p.cid).unwrap_or_default();
                self.state = SlotState::Deactivating;
                self.reason = reason;
                radio.deactivate(DeactivateRequest {
                    slot: self.index,
                    generation: self.generation,
                    cid,
                    reason,
                });
                Ok(())
            }
            SlotState::Activating => {
                self.state = SlotState::Deactivating;
                self.reason = reason;
                self.teardown_pending = true;
                debug!(slot = self.index, "disconnect deferred until activation reports");
                Ok(())
            }
            _ => Err(self.invalid("disconnect")),
        }
    }

    /// Apply a teardown result. The slot always ends Inactive; a failed
    /// teardown is logged and not retried. Returns false for a stale
    /// completion.
    pub fn on_disconnect_done(&mut self, generation: u64, result: Result<(), FailCause>) -> bool {
        if self.state != SlotState::Deactivating
            || generation != self.generation
            || self.teardown_pending
        {
            debug!(slot = self.index, generation, state = %self.state, "ignoring stale disconnect completion");
            return false;
        }
        if let Err(cause) = result {
            warn!(slot = self.index, cause = ?cause, "teardown failed, releasing slot anyway");
        }
        self.reset();
        true
    }

    /// Local reset with no network round-trip.
    pub fn clear_settings(&mut self) {
        if self.state != SlotState::Inactive {
            debug!(slot = self.index, state = %self.state, "clearing slot");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = SlotState::Inactive;
        self.apn = None;
        self.params = None;
        self.teardown_pending = false;
    }

    fn invalid(&self, op: &'static str) -> SlotError {
        SlotError::InvalidState {
            slot: self.index,
            op,
            state: self.state,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn apn(&self) -> Option<&ApnSetting> {
        self.apn.as_ref()
    }

    pub fn params(&self) -> Option<&NetworkParams> {
        self.params.as_ref()
    }

    /// Reason of the last connect or disconnect.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn is_inactive(&self) -> bool {
        self.state == SlotState::Inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apn::{columns, ApnRow};
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Radio {
        activations: Vec<ActivateRequest>,
        deactivations: Vec<DeactivateRequest>,
    }

    impl RadioCommands for Radio {
        fn activate(&mut self, req: ActivateRequest) {
            self.activations.push(req);
        }
        fn deactivate(&mut self, req: DeactivateRequest) {
            self.deactivations.push(req);
        }
        fn query_active_contexts(&mut self) {}
        fn reregister_network(&mut self) {}
    }

    fn apn() -> ApnSetting {
        ApnSetting::from_row(
            &ApnRow::new()
                .with(columns::ID, "1")
                .with(columns::NUMERIC, "310260")
                .with(columns::APN, "internet"),
        )
        .unwrap()
    }

    fn params(cid: u32) -> NetworkParams {
        NetworkParams {
            interface: "rmnet0".into(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ],
            cid,
        }
    }

    // ─── Connect ────────────────────────────────────────────────────────

    #[test]
    fn connect_then_success_goes_active() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        assert_eq!(slot.state(), SlotState::Activating);
        assert_eq!(radio.activations.len(), 1);
        assert_eq!(radio.activations[0].generation, gen);

        let out = slot.on_setup_complete(gen, Ok(params(5)), &mut radio);
        assert_eq!(out, SetupOutcome::Connected);
        assert_eq!(slot.state(), SlotState::Active);
        assert_eq!(slot.params().map(|p| p.cid), Some(5));
        assert_eq!(slot.params().map(|p| p.dns.len()), Some(1));
    }

    #[test]
    fn connect_requires_inactive() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(2);
        slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        let err = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap_err();
        assert_eq!(
            err,
            SlotError::InvalidState {
                slot: 2,
                op: "connect",
                state: SlotState::Activating
            }
        );
        assert_eq!(radio.activations.len(), 1);
    }

    #[test]
    fn failure_returns_to_inactive() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        let out = slot.on_setup_complete(gen, Err(FailCause::InsufficientResources), &mut radio);
        assert_eq!(out, SetupOutcome::Failed(FailCause::InsufficientResources));
        assert!(slot.is_inactive());
        assert!(slot.apn().is_none());
    }

    // ─── Disconnect ─────────────────────────────────────────────────────

    #[test]
    fn failed_teardown_still_frees_slot() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        slot.on_setup_complete(gen, Ok(params(9)), &mut radio);
        slot.disconnect(Reason::PdpReset, &mut radio).unwrap();
        assert_eq!(radio.deactivations[0].cid, 9);

        assert!(slot.on_disconnect_done(gen, Err(FailCause::RadioNotAvailable)));
        assert!(slot.is_inactive());
        assert!(slot.params().is_none());
        assert!(slot.apn().is_none());
    }

    #[test]
    fn disconnect_from_inactive_is_invalid() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        assert!(slot.disconnect(Reason::DataDisabled, &mut radio).is_err());
        assert!(radio.deactivations.is_empty());
    }

    #[test]
    fn disconnect_while_activating_waits_for_completion() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        slot.disconnect(Reason::ApnSwitched, &mut radio).unwrap();
        assert!(radio.deactivations.is_empty());
        assert!(!slot.on_disconnect_done(gen, Ok(())));

        let out = slot.on_setup_complete(gen, Ok(params(4)), &mut radio);
        assert_eq!(out, SetupOutcome::Stale);
        assert_eq!(radio.deactivations.len(), 1);
        assert_eq!(radio.deactivations[0].cid, 4);
        assert!(slot.on_disconnect_done(gen, Ok(())));
        assert!(slot.is_inactive());
    }

    #[test]
    fn disconnect_while_activating_then_failure_is_torn_down() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        slot.disconnect(Reason::ApnSwitched, &mut radio).unwrap();
        let out = slot.on_setup_complete(gen, Err(FailCause::Unknown), &mut radio);
        assert_eq!(out, SetupOutcome::TornDown);
        assert!(slot.is_inactive());
        assert!(radio.deactivations.is_empty());
    }

    // ─── Stale Completions ──────────────────────────────────────────────

    #[test]
    fn late_success_after_clear_is_torn_down() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let gen = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        slot.clear_settings();

        let out = slot.on_setup_complete(gen, Ok(params(7)), &mut radio);
        assert_eq!(out, SetupOutcome::Stale);
        assert!(slot.is_inactive());
        assert_eq!(radio.deactivations.len(), 1);
        assert_eq!(radio.deactivations[0].cid, 7);
        assert!(!slot.on_disconnect_done(gen, Ok(())));
    }

    #[test]
    fn old_generation_does_not_touch_new_attempt() {
        let mut radio = Radio::default();
        let mut slot = ConnectionSlot::new(0);
        let old = slot.connect(apn(), Reason::SimLoaded, &mut radio).unwrap();
        slot.clear_settings();
        let new = slot.connect(apn(), Reason::RetryAlarm, &mut radio).unwrap();
        assert_ne!(old, new);

        let out = slot.on_setup_complete(old, Err(FailCause::Unknown), &mut radio);
        assert_eq!(out, SetupOutcome::Stale);
        assert_eq!(slot.state(), SlotState::Activating);
        assert_eq!(slot.reason(), Reason::RetryAlarm);
    }

    #[test]
    fn unspecified_dns_entries_are_filtered() {
        let p = params(1).without_unspecified_dns();
        assert_eq!(p.dns, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
    }
}
