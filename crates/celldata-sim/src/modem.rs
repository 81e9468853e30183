//! Scripted modem.
//!
//! Answers every radio command through the runtime's event channel.
//! Activation outcomes are queued per attempt; with an empty queue an
//! activation succeeds. Allocated context ids are reported by context
//! queries until they are deactivated or dropped.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use celldata_supervisor::cause::FailCause;
use celldata_supervisor::collab::{ActivateRequest, DeactivateRequest, RadioCommands};
use celldata_supervisor::event::{ContextInfo, Event};
use celldata_supervisor::slot::NetworkParams;
use celldata_supervisor::EventSender;
use tracing::{debug, info, warn};

/// Counters of the commands the modem has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStats {
    pub activations: usize,
    pub deactivations: usize,
    pub context_queries: usize,
    pub reregistrations: usize,
}

#[derive(Debug)]
struct ModemState {
    outcomes: VecDeque<Result<(), FailCause>>,
    teardown_failures: usize,
    /// cid → still active on the network side.
    contexts: BTreeMap<u32, bool>,
    next_cid: u32,
    stats: ModemStats,
}

impl Default for ModemState {
    fn default() -> Self {
        Self {
            outcomes: VecDeque::new(),
            teardown_failures: 0,
            contexts: BTreeMap::new(),
            next_cid: 1,
            stats: ModemStats::default(),
        }
    }
}

/// Scripting handle shared with the [`SimModem`] owned by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct ModemHandle {
    state: Arc<Mutex<ModemState>>,
}

impl ModemHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` activations with `cause`.
    pub fn fail_next(&self, cause: FailCause, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.outcomes.push_back(Err(cause));
        }
    }

    /// Report failure for the next `count` teardowns.
    pub fn fail_teardowns(&self, count: usize) {
        self.lock().teardown_failures += count;
    }

    /// Mark every context as gone on the network side and return how many
    /// were dropped.
    pub fn drop_contexts(&self) -> usize {
        let mut state = self.lock();
        let n = state.contexts.len();
        state.contexts.clear();
        n
    }

    pub fn active_contexts(&self) -> Vec<u32> {
        self.lock()
            .contexts
            .iter()
            .filter(|(_, active)| **active)
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn stats(&self) -> ModemStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The [`RadioCommands`] side of the modem.
#[derive(Debug)]
pub struct SimModem {
    events: EventSender,
    handle: ModemHandle,
}

impl SimModem {
    pub fn new(events: EventSender, handle: ModemHandle) -> Self {
        Self { events, handle }
    }

    fn post(&self, event: Event) {
        if let Err(e) = self.events.post(event) {
            warn!(error = %e, "modem could not reach supervisor");
        }
    }
}

fn params_for(cid: u32) -> NetworkParams {
    NetworkParams {
        interface: "rmnet0".into(),
        address: IpAddr::V4(Ipv4Addr::new(10, 170, (cid >> 8) as u8, cid as u8)),
        gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 170, 0, 1))),
        dns: vec![
            IpAddr::V4(Ipv4Addr::new(10, 177, 0, 34)),
            IpAddr::V4(Ipv4Addr::new(10, 177, 0, 210)),
        ],
        cid,
    }
}

impl RadioCommands for SimModem {
    fn activate(&mut self, req: ActivateRequest) {
        let result = {
            let mut state = self.handle.lock();
            state.stats.activations += 1;
            match state.outcomes.pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    let cid = state.next_cid;
                    state.next_cid += 1;
                    state.contexts.insert(cid, true);
                    Ok(params_for(cid))
                }
                Err(cause) => Err(cause),
            }
        };
        match &result {
            Ok(p) => info!(apn = %req.apn.apn, cid = p.cid, "modem: context activated"),
            Err(cause) => info!(apn = %req.apn.apn, cause = ?cause, "modem: activation rejected"),
        }
        self.post(Event::SetupComplete {
            slot: req.slot,
            generation: req.generation,
            result,
        });
    }

    fn deactivate(&mut self, req: DeactivateRequest) {
        let result = {
            let mut state = self.handle.lock();
            state.stats.deactivations += 1;
            state.contexts.remove(&req.cid);
            if state.teardown_failures > 0 {
                state.teardown_failures -= 1;
                Err(FailCause::RadioNotAvailable)
            } else {
                Ok(())
            }
        };
        debug!(cid = req.cid, reason = %req.reason, ok = result.is_ok(), "modem: deactivate");
        self.post(Event::DisconnectDone {
            slot: req.slot,
            generation: req.generation,
            result,
        });
    }

    fn query_active_contexts(&mut self) {
        let contexts = {
            let mut state = self.handle.lock();
            state.stats.context_queries += 1;
            state
                .contexts
                .iter()
                .map(|(cid, active)| ContextInfo {
                    cid: *cid,
                    active: *active,
                })
                .collect()
        };
        self.post(Event::ContextList {
            contexts,
            explicit: true,
        });
    }

    fn reregister_network(&mut self) {
        self.handle.lock().stats.reregistrations += 1;
        info!("modem: re-registering");
        self.post(Event::Detached);
        self.post(Event::Attached);
    }
}
