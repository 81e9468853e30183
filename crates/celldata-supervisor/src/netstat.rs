//! # Stall Detection
//!
//! Samples the cumulative packet counters while a session is connected and
//! flags a stall when packets keep going out without anything coming back.
//!
//! Per poll interval:
//!
//! ```text
//!   sent>0 recv>0   → DataInOut, stall counters and reset count cleared
//!   sent>0 recv=0   → DataOut,   outbound-only packets accumulate (idle only)
//!   sent=0 recv>0   → DataIn,    stall counters and reset count cleared
//!   sent=0 recv=0   → None
//! ```
//!
//! Once the accumulated outbound-only count reaches `stall_packet_threshold`
//! every further such poll is counted; `stall_poll_limit` of them in a row
//! is a stall. Recovery escalates from reconnecting the session (up to
//! `max_reset_count` times) to a network re-registration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collab::TrafficSample;
use crate::notify::Activity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetStatConfig {
    pub poll: Duration,
    pub screen_off_poll: Duration,
    pub stall_packet_threshold: u64,
    pub stall_poll_limit: u32,
    pub max_reset_count: u32,
}

impl Default for NetStatConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(1000),
            screen_off_poll: Duration::from_millis(600_000),
            stall_packet_threshold: 10,
            stall_poll_limit: 24,
            max_reset_count: 3,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub activity: Activity,
    /// Activity changed and should be reported.
    pub activity_changed: bool,
    pub stalled: bool,
}

/// Recovery step chosen for a detected stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Tear the session down and set it up again.
    Reconnect,
    /// Ask the radio to re-register with the network.
    Reregister,
}

#[derive(Debug, Clone)]
pub struct NetStatPoller {
    cfg: NetStatConfig,
    enabled: bool,
    prev: Option<TrafficSample>,
    sent_since_last_recv: u64,
    no_recv_polls: u32,
    reset_count: u32,
    activity: Activity,
    screen_on: bool,
}

impl NetStatPoller {
    pub fn new(cfg: NetStatConfig) -> Self {
        Self {
            cfg,
            enabled: false,
            prev: None,
            sent_since_last_recv: 0,
            no_recv_polls: 0,
            reset_count: 0,
            activity: Activity::None,
            screen_on: true,
        }
    }

    /// Begin polling with fresh statistics. No-op if already running.
    pub fn start(&mut self) -> bool {
        if self.enabled {
            return false;
        }
        self.reset_stats();
        self.enabled = true;
        debug!("netstat poll started");
        true
    }

    pub fn stop(&mut self) {
        if self.enabled {
            debug!("netstat poll stopped");
        }
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Clear traffic statistics. The recovery reset count is kept.
    pub fn reset_stats(&mut self) {
        self.prev = None;
        self.sent_since_last_recv = 0;
        self.no_recv_polls = 0;
    }

    /// Process one counter sample. `idle` is false during a voice call;
    /// outbound-only traffic then does not count toward a stall.
    pub fn poll(&mut self, sample: Option<TrafficSample>, idle: bool) -> PollReport {
        let mut report = PollReport {
            activity: self.activity,
            activity_changed: false,
            stalled: false,
        };
        if !self.enabled {
            return report;
        }
        let current = sample.unwrap_or_default();
        let prev = self.prev.replace(current);

        if let Some(prev) = prev {
            let sent = current.tx_packets.saturating_sub(prev.tx_packets);
            let received = current.rx_packets.saturating_sub(prev.rx_packets);
            let activity = match (sent > 0, received > 0) {
                (true, true) => {
                    self.inbound_seen();
                    Activity::DataInOut
                }
                (true, false) => {
                    if idle {
                        self.sent_since_last_recv += sent;
                    } else {
                        self.sent_since_last_recv = 0;
                    }
                    Activity::DataOut
                }
                (false, true) => {
                    self.inbound_seen();
                    Activity::DataIn
                }
                (false, false) => Activity::None,
            };
            if activity != self.activity && self.screen_on {
                self.activity = activity;
                report.activity_changed = true;
            }
            report.activity = self.activity;

            if self.sent_since_last_recv >= self.cfg.stall_packet_threshold {
                self.no_recv_polls += 1;
                debug!(
                    sent_since_last_recv = self.sent_since_last_recv,
                    no_recv_polls = self.no_recv_polls,
                    "no inbound traffic"
                );
                if self.no_recv_polls >= self.cfg.stall_poll_limit {
                    info!(
                        sent_since_last_recv = self.sent_since_last_recv,
                        "data stall detected"
                    );
                    self.enabled = false;
                    report.stalled = true;
                }
            } else {
                self.no_recv_polls = 0;
            }
        }
        report
    }

    /// Pick the next recovery step.
    pub fn escalate(&mut self) -> Recovery {
        if self.reset_count < self.cfg.max_reset_count {
            self.reset_count += 1;
            Recovery::Reconnect
        } else {
            self.reset_count = 0;
            Recovery::Reregister
        }
    }

    pub fn set_screen_on(&mut self, on: bool) {
        self.screen_on = on;
    }

    /// Interval until the next poll.
    pub fn interval(&self) -> Duration {
        if self.screen_on {
            self.cfg.poll
        } else {
            self.cfg.screen_off_poll
        }
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    fn inbound_seen(&mut self) {
        self.sent_since_last_recv = 0;
        self.no_recv_polls = 0;
        self.reset_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> NetStatConfig {
        NetStatConfig {
            stall_packet_threshold: 10,
            stall_poll_limit: 3,
            max_reset_count: 2,
            ..NetStatConfig::default()
        }
    }

    fn s(tx: u64, rx: u64) -> Option<TrafficSample> {
        Some(TrafficSample {
            tx_packets: tx,
            rx_packets: rx,
        })
    }

    /// Drive outbound-only polls from `tx` until a stall is reported.
    fn drive_to_stall(p: &mut NetStatPoller, mut tx: u64) -> (u32, u64) {
        let mut polls = 0;
        loop {
            tx += 20;
            polls += 1;
            if p.poll(s(tx, 0), true).stalled {
                return (polls, tx);
            }
            assert!(polls < 100, "never stalled");
        }
    }

    // ─── Activity ───────────────────────────────────────────────────────

    #[test]
    fn first_sample_is_baseline() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        let r = p.poll(s(1000, 1000), true);
        assert_eq!(r.activity, Activity::None);
        assert!(!r.activity_changed);
    }

    #[test]
    fn activity_follows_deltas() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.poll(s(0, 0), true);
        assert_eq!(p.poll(s(5, 5), true).activity, Activity::DataInOut);
        assert_eq!(p.poll(s(5, 9), true).activity, Activity::DataIn);
        assert_eq!(p.poll(s(8, 9), true).activity, Activity::DataOut);
        let r = p.poll(s(8, 9), true);
        assert_eq!(r.activity, Activity::None);
        assert!(r.activity_changed);
    }

    #[test]
    fn screen_off_suppresses_activity_changes() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.set_screen_on(false);
        assert_eq!(p.interval(), NetStatConfig::default().screen_off_poll);
        p.poll(s(0, 0), true);
        let r = p.poll(s(5, 5), true);
        assert!(!r.activity_changed);
        assert_eq!(r.activity, Activity::None);
    }

    // ─── Stall Detection ────────────────────────────────────────────────

    #[test]
    fn outbound_only_traffic_stalls() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.poll(s(0, 0), true);
        let (polls, _) = drive_to_stall(&mut p, 0);
        assert_eq!(polls, 3);
        assert!(!p.is_enabled());
    }

    #[test]
    fn inbound_traffic_clears_stall_progress() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.poll(s(0, 0), true);
        p.poll(s(20, 0), true);
        p.poll(s(40, 0), true);
        p.poll(s(40, 1), true);
        assert!(!p.poll(s(60, 1), true).stalled);
        assert!(!p.poll(s(80, 1), true).stalled);
        assert!(p.poll(s(100, 1), true).stalled);
    }

    #[test]
    fn voice_call_does_not_accumulate() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.poll(s(0, 0), false);
        for i in 1..20 {
            assert!(!p.poll(s(i * 20, 0), false).stalled);
        }
    }

    #[test]
    fn unreadable_counters_read_as_zero() {
        let mut p = NetStatPoller::new(cfg());
        p.start();
        p.poll(s(10, 10), true);
        let r = p.poll(None, true);
        assert_eq!(r.activity, Activity::None);
        assert!(!r.stalled);
    }

    // ─── Recovery ───────────────────────────────────────────────────────

    #[test]
    fn escalation_reconnects_then_reregisters() {
        let mut p = NetStatPoller::new(cfg());
        assert_eq!(p.escalate(), Recovery::Reconnect);
        assert_eq!(p.escalate(), Recovery::Reconnect);
        assert_eq!(p.escalate(), Recovery::Reregister);
        assert_eq!(p.reset_count(), 0);
        assert_eq!(p.escalate(), Recovery::Reconnect);
    }

    #[test]
    fn inbound_traffic_clears_reset_count() {
        let mut p = NetStatPoller::new(cfg());
        p.escalate();
        p.escalate();
        p.start();
        p.poll(s(0, 0), true);
        p.poll(s(0, 3), true);
        assert_eq!(p.reset_count(), 0);
        assert_eq!(p.escalate(), Recovery::Reconnect);
    }

    #[test]
    fn restart_keeps_reset_count() {
        let mut p = NetStatPoller::new(cfg());
        p.escalate();
        p.stop();
        assert!(p.start());
        assert!(!p.start());
        assert_eq!(p.reset_count(), 1);
    }
}
