//! Property-based tests for the retry schedule and the session machine.
//!
//! The session property drives a supervisor with two slots through random
//! interleavings of status changes, completions and timer firings, and
//! checks the pool and timer invariants after every step.

use proptest::prelude::*;
use std::time::Duration;

use celldata_supervisor::apn::ApnType;
use celldata_supervisor::cause::FailCause;
use celldata_supervisor::config::SupervisorConfig;
use celldata_supervisor::event::{ContextInfo, Event, TimerKind, TimerToken};
use celldata_supervisor::retry::RetryPolicy;
use celldata_supervisor::slot::SlotState;
use celldata_supervisor::supervisor::SessionState;
use celldata_supervisor::testing::{apn_row, network_params, Harness};

// ─── Retry Schedule ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn retry_delays_follow_schedule(
        delays in prop::collection::vec(1u64..100_000, 1..8),
        max_retries in 1u32..12,
        seed in any::<u64>(),
    ) {
        let spec = format!(
            "max_retries={max_retries}, {}",
            delays.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")
        );
        let mut policy = RetryPolicy::new(seed);
        policy.configure(&spec).unwrap();

        let mut attempts = 0;
        while policy.is_retry_needed() {
            let idx = (attempts as usize).min(delays.len() - 1);
            prop_assert_eq!(policy.next_delay(), Duration::from_millis(delays[idx]));
            policy.increase_attempt();
            attempts += 1;
            prop_assert!(policy.attempt() <= max_retries);
        }
        prop_assert_eq!(attempts, max_retries);

        policy.retry_forever_using_last_timeout();
        let last = policy.next_delay();
        for _ in 0..3 {
            prop_assert!(policy.is_retry_needed());
            policy.increase_attempt();
            prop_assert_eq!(policy.next_delay(), last);
        }
    }

    #[test]
    fn retry_jitter_stays_in_bounds(
        base in 0u64..10_000,
        jitter in 1u64..5_000,
        seed in any::<u64>(),
    ) {
        let mut policy = RetryPolicy::new(seed);
        policy.configure(&format!("max_retries=infinite, {base}:{jitter}")).unwrap();
        for _ in 0..16 {
            let d = policy.next_delay();
            prop_assert!(d >= Duration::from_millis(base));
            prop_assert!(d < Duration::from_millis(base + jitter));
            policy.increase_attempt();
        }
    }
}

// ─── Session Machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    Post(Event),
    /// Answer the oldest outstanding activation.
    SetupOk,
    SetupErr(FailCause),
    /// Answer the oldest outstanding teardown.
    DisconnectOk,
    DisconnectErr,
    Fire(TimerKind),
    FireStale(TimerKind),
    Request(ApnType),
    Release(ApnType),
}

fn timer_kind() -> impl Strategy<Value = TimerKind> {
    prop_oneof![
        Just(TimerKind::Reconnect),
        Just(TimerKind::ApnDelay),
        Just(TimerKind::NetStatPoll),
        Just(TimerKind::ContextPoll),
    ]
}

fn fail_cause() -> impl Strategy<Value = FailCause> {
    prop_oneof![
        Just(FailCause::Unknown),
        Just(FailCause::InsufficientResources),
        Just(FailCause::UserAuthentication),
        Just(FailCause::ServiceOptionNotSubscribed),
        Just(FailCause::RadioNotAvailable),
    ]
}

fn status_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Attached),
        Just(Event::Detached),
        Just(Event::SimReady {
            operator: "310260".into()
        }),
        Just(Event::SimReady {
            operator: "310410".into()
        }),
        Just(Event::SimNotReady),
        Just(Event::RoamingOn),
        Just(Event::RoamingOff),
        Just(Event::RadioAvailable),
        Just(Event::RadioOffOrUnavailable),
        any::<bool>().prop_map(Event::DesiredPower),
        Just(Event::PsRestrictEnabled),
        Just(Event::PsRestrictDisabled),
        Just(Event::VoiceCallStarted),
        Just(Event::VoiceCallEnded),
        Just(Event::ApnTableChanged),
        any::<bool>().prop_map(Event::DataRoamingAllowed),
        any::<bool>().prop_map(Event::MasterDataEnabled),
        Just(Event::ContextList {
            contexts: vec![],
            explicit: true
        }),
        (1u32..4, any::<bool>(), any::<bool>()).prop_map(|(cid, active, explicit)| {
            Event::ContextList {
                contexts: vec![ContextInfo { cid, active }],
                explicit,
            }
        }),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => status_event().prop_map(Step::Post),
        3 => Just(Step::SetupOk),
        2 => fail_cause().prop_map(Step::SetupErr),
        2 => Just(Step::DisconnectOk),
        1 => Just(Step::DisconnectErr),
        3 => timer_kind().prop_map(Step::Fire),
        1 => timer_kind().prop_map(Step::FireStale),
        1 => prop_oneof![Just(ApnType::Mms), Just(ApnType::Supl), Just(ApnType::Default)]
            .prop_map(Step::Request),
        1 => prop_oneof![Just(ApnType::Mms), Just(ApnType::Default)].prop_map(Step::Release),
    ]
}

/// Harness plus the radio's view of which commands are still unanswered.
struct Driver {
    h: Harness,
    answered_activations: usize,
    answered_deactivations: usize,
}

impl Driver {
    fn new() -> Self {
        let mut cfg = SupervisorConfig::default();
        cfg.session.pool_size = 2;
        cfg.retry.default_spec = Some("max_retries=2, 100, 200".into());
        let h = Harness::new(cfg);
        h.apn_table.set_rows(
            "310260",
            vec![
                apn_row(1, "310260", "fast.t-mobile.com", "default,supl"),
                apn_row(2, "310260", "epc.tmobile.com", "default"),
                apn_row(3, "310260", "mms.msg.eng.t-mobile.com", "mms"),
            ],
        );
        h.apn_table
            .set_rows("310410", vec![apn_row(7, "310410", "broadband", "default,mms")]);
        Self {
            h,
            answered_activations: 0,
            answered_deactivations: 0,
        }
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Post(event) => self.h.event(event),
            Step::SetupOk | Step::SetupErr(_) => {
                let acts = self.h.radio.activations();
                let Some(req) = acts.get(self.answered_activations) else {
                    return;
                };
                self.answered_activations += 1;
                let result = match step {
                    Step::SetupErr(cause) => Err(cause),
                    _ => Ok(network_params((req.slot as u32) + 1)),
                };
                self.h.event(Event::SetupComplete {
                    slot: req.slot,
                    generation: req.generation,
                    result,
                });
            }
            Step::DisconnectOk | Step::DisconnectErr => {
                let deacts = self.h.radio.deactivations();
                let Some(req) = deacts.get(self.answered_deactivations).copied() else {
                    return;
                };
                self.answered_deactivations += 1;
                let result = match step {
                    Step::DisconnectErr => Err(FailCause::RadioNotAvailable),
                    _ => Ok(()),
                };
                self.h.event(Event::DisconnectDone {
                    slot: req.slot,
                    generation: req.generation,
                    result,
                });
            }
            Step::Fire(kind) => {
                if let Some(token) = self.h.timers.take(kind) {
                    self.h.event(Event::TimerFired(token));
                }
            }
            Step::FireStale(kind) => {
                let token = self
                    .h
                    .timers
                    .cancelled()
                    .into_iter()
                    .rev()
                    .find(|t| t.kind == kind)
                    .unwrap_or(TimerToken { kind, id: 0 });
                let before = self.h.radio.activations().len();
                self.h.event(Event::TimerFired(token));
                assert_eq!(
                    self.h.radio.activations().len(),
                    before,
                    "cancelled timer triggered an activation"
                );
            }
            Step::Request(cap) => {
                self.h.sup.request_capability(cap);
            }
            Step::Release(cap) => {
                self.h.sup.release_capability(cap);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn pool_and_timer_invariants_hold(steps in prop::collection::vec(step(), 1..80)) {
        let mut d = Driver::new();
        for step in steps {
            d.apply(step.clone());
            let sup = &d.h.sup;
            let slots: Vec<SlotState> = sup.slots().iter().map(|s| s.state()).collect();
            let activating = slots.iter().filter(|s| **s == SlotState::Activating).count();
            let active = slots.iter().filter(|s| **s == SlotState::Active).count();

            prop_assert!(activating <= 1, "after {:?}: {:?}", step, slots);
            prop_assert!(activating + active <= 1, "after {:?}: {:?}", step, slots);
            if sup.state() == SessionState::Connected {
                prop_assert_eq!(active, 1, "after {:?}", step);
            }
            if matches!(sup.state(), SessionState::Idle | SessionState::Failed) {
                prop_assert!(
                    slots.iter().all(|s| *s == SlotState::Inactive),
                    "after {:?} in {}: {:?}", step, sup.state(), slots
                );
            }
            for kind in [
                TimerKind::Reconnect,
                TimerKind::ApnDelay,
                TimerKind::NetStatPoll,
                TimerKind::ContextPoll,
            ] {
                prop_assert_eq!(
                    sup.pending_timer(kind),
                    d.h.timers.pending(kind).map(|(t, _)| t),
                    "timer {:?} after {:?}", kind, step
                );
            }
            prop_assert!(sup.retry_policy().attempt() <= sup.retry_policy().max_retries());
        }
    }
}
