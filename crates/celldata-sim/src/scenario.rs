//! Timed scenario files.
//!
//! A scenario carries the APN table and a list of steps. Each step waits
//! `after_ms` and then performs one action against the running supervisor
//! or the simulated modem:
//!
//! ```toml
//! [[apn]]
//! _id = 1
//! numeric = "310260"
//! apn = "fast.t-mobile.com"
//! type = "default"
//!
//! [[step]]
//! action = "fail_next"
//! cause = 26
//! count = 2
//!
//! [[step]]
//! action = "attach"
//!
//! [[step]]
//! action = "sim_ready"
//! operator = "310260"
//!
//! [[step]]
//! action = "expect_state"
//! state = "connected"
//! within_ms = 2000
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use celldata_supervisor::apn::ApnType;
use celldata_supervisor::cause::FailCause;
use celldata_supervisor::collab::{Collaborators, PreferenceStore};
use celldata_supervisor::event::Event;
use celldata_supervisor::notify::Notification;
use celldata_supervisor::supervisor::{SessionSnapshot, SessionState};
use celldata_supervisor::{SupervisorConfig, SupervisorRuntime};
use serde::Deserialize;
use tracing::{info, warn};

use crate::counters::SimCounters;
use crate::modem::{ModemHandle, ModemStats, SimModem};
use crate::table::{rows_from_values, SimApnTable};

fn default_settle_ms() -> u64 {
    100
}

fn default_within_ms() -> u64 {
    1000
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Quiet period after the last step before the final snapshot.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub apn: Vec<BTreeMap<String, toml::Value>>,
    #[serde(default)]
    pub step: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub after_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Attach,
    Detach,
    SimReady {
        operator: String,
    },
    SimNotReady,
    RoamingOn,
    RoamingOff,
    RadioOn,
    RadioOff,
    DataEnabled {
        enabled: bool,
    },
    DataRoaming {
        allowed: bool,
    },
    Screen {
        on: bool,
    },
    VoiceCall {
        active: bool,
    },
    /// Replace the APN table and notify the supervisor.
    ApnTable {
        #[serde(default)]
        apn: Vec<BTreeMap<String, toml::Value>>,
    },
    /// Queue `count` activation failures with a 3GPP cause code.
    FailNext {
        cause: u32,
        #[serde(default = "one")]
        count: usize,
    },
    FailTeardown {
        #[serde(default = "one")]
        count: usize,
    },
    /// The network silently drops every context.
    DropContexts,
    Traffic {
        tx: u64,
        rx: u64,
    },
    Request {
        capability: String,
    },
    Release {
        capability: String,
    },
    ExpectState {
        state: SessionState,
        #[serde(default = "default_within_ms")]
        within_ms: u64,
    },
}

impl Scenario {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        toml::from_str(input).context("invalid scenario TOML")
    }
}

/// Outcome of a scenario run.
#[derive(Debug)]
pub struct Report {
    pub notifications: Vec<Notification>,
    pub final_snapshot: SessionSnapshot,
    pub modem: ModemStats,
    /// Failed `expect_state` steps, one line each.
    pub failures: Vec<String>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn transitions(&self) -> Vec<SessionState> {
        self.notifications
            .iter()
            .filter_map(|n| match n {
                Notification::StateTransition { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

/// Run `scenario` against a fresh runtime.
pub fn run(
    cfg: SupervisorConfig,
    scenario: &Scenario,
    prefs: Box<dyn PreferenceStore + Send>,
) -> anyhow::Result<Report> {
    let table = SimApnTable::new(rows_from_values(&scenario.apn));
    let modem = ModemHandle::new();
    let counters = SimCounters::new();

    let mut rt = {
        let table = table.clone();
        let modem = modem.clone();
        let counters = counters.clone();
        SupervisorRuntime::spawn(cfg, move |events| Collaborators {
            radio: Box::new(SimModem::new(events, modem)),
            apn_table: Box::new(table),
            counters: Box::new(counters),
            prefs,
        })
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    rt.subscribe(move |n| {
        match serde_json::to_string(n) {
            Ok(json) => info!(notification = %json, "notify"),
            Err(e) => warn!(error = %e, "unserializable notification"),
        }
        let _ = tx.send(n.clone());
    })?;

    info!(
        scenario = scenario.name.as_deref().unwrap_or("unnamed"),
        steps = scenario.step.len(),
        "scenario starting"
    );

    let mut failures = Vec::new();
    for (idx, step) in scenario.step.iter().enumerate() {
        if step.after_ms > 0 {
            thread::sleep(Duration::from_millis(step.after_ms));
        }
        if let Some(failure) = apply(&rt, &table, &modem, &counters, &step.action)
            .with_context(|| format!("step {idx} ({:?})", step.action))?
        {
            warn!(step = idx, "{failure}");
            failures.push(format!("step {idx}: {failure}"));
        }
    }

    thread::sleep(Duration::from_millis(scenario.settle_ms));
    let final_snapshot = rt.snapshot();
    rt.shutdown();

    Ok(Report {
        notifications: rx.try_iter().collect(),
        final_snapshot,
        modem: modem.stats(),
        failures,
    })
}

/// Perform one action. Returns a failure message for an unmet expectation.
fn apply(
    rt: &SupervisorRuntime,
    table: &SimApnTable,
    modem: &ModemHandle,
    counters: &SimCounters,
    action: &Action,
) -> anyhow::Result<Option<String>> {
    match action {
        Action::Attach => rt.post(Event::Attached)?,
        Action::Detach => rt.post(Event::Detached)?,
        Action::SimReady { operator } => rt.post(Event::SimReady {
            operator: operator.clone(),
        })?,
        Action::SimNotReady => rt.post(Event::SimNotReady)?,
        Action::RoamingOn => rt.post(Event::RoamingOn)?,
        Action::RoamingOff => rt.post(Event::RoamingOff)?,
        Action::RadioOn => {
            rt.post(Event::RadioAvailable)?;
            rt.post(Event::DesiredPower(true))?;
        }
        Action::RadioOff => {
            rt.post(Event::DesiredPower(false))?;
            rt.post(Event::RadioOffOrUnavailable)?;
        }
        Action::DataEnabled { enabled } => rt.post(Event::MasterDataEnabled(*enabled))?,
        Action::DataRoaming { allowed } => rt.post(Event::DataRoamingAllowed(*allowed))?,
        Action::Screen { on } => rt.post(if *on { Event::ScreenOn } else { Event::ScreenOff })?,
        Action::VoiceCall { active } => rt.post(if *active {
            Event::VoiceCallStarted
        } else {
            Event::VoiceCallEnded
        })?,
        Action::ApnTable { apn } => {
            table.replace(rows_from_values(apn));
            rt.post(Event::ApnTableChanged)?;
        }
        Action::FailNext { cause, count } => modem.fail_next(FailCause::from_code(*cause), *count),
        Action::FailTeardown { count } => modem.fail_teardowns(*count),
        Action::DropContexts => {
            let dropped = modem.drop_contexts();
            info!(dropped, "network dropped contexts");
            rt.post(Event::ContextList {
                contexts: Vec::new(),
                explicit: false,
            })?;
        }
        Action::Traffic { tx, rx } => counters.add(*tx, *rx),
        Action::Request { capability } => {
            let cap = ApnType::from_str(capability)?;
            let answer = rt.request_capability(cap)?;
            info!(capability = %cap, answer = ?answer, "capability requested");
        }
        Action::Release { capability } => {
            let cap = ApnType::from_str(capability)?;
            let released = rt.release_capability(cap)?;
            info!(capability = %cap, released, "capability released");
        }
        Action::ExpectState { state, within_ms } => {
            let deadline = Instant::now() + Duration::from_millis(*within_ms);
            loop {
                let current = rt.snapshot().state;
                if current == *state {
                    break;
                }
                if Instant::now() >= deadline {
                    return Ok(Some(format!(
                        "expected {state} within {within_ms}ms, still {current}"
                    )));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_steps() {
        let s = Scenario::from_toml_str(
            r#"
            name = "parse"

            [[apn]]
            _id = 1
            numeric = "310260"
            apn = "fast.t-mobile.com"

            [[step]]
            action = "fail_next"
            cause = 26

            [[step]]
            after_ms = 20
            action = "sim_ready"
            operator = "310260"

            [[step]]
            action = "expect_state"
            state = "connected"
            "#,
        )
        .unwrap();
        assert_eq!(s.settle_ms, 100);
        assert_eq!(s.apn.len(), 1);
        assert_eq!(
            s.step[0].action,
            Action::FailNext {
                cause: 26,
                count: 1
            }
        );
        assert_eq!(s.step[1].after_ms, 20);
        assert_eq!(
            s.step[2].action,
            Action::ExpectState {
                state: SessionState::Connected,
                within_ms: 1000
            }
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = Scenario::from_toml_str("[[step]]\naction = \"explode\"\n").unwrap_err();
        assert!(err.to_string().contains("scenario"));
    }
}
