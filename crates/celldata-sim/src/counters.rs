use std::sync::{Arc, Mutex};

use celldata_supervisor::collab::{TrafficCounters, TrafficSample};

#[derive(Debug, Default)]
struct Inner {
    sample: TrafficSample,
    unreadable: bool,
}

/// Cumulative interface counters, advanced by the scenario.
#[derive(Debug, Clone, Default)]
pub struct SimCounters {
    inner: Arc<Mutex<Inner>>,
}

impl SimCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tx_packets: u64, rx_packets: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sample.tx_packets += tx_packets;
        inner.sample.rx_packets += rx_packets;
    }

    pub fn set_unreadable(&self, unreadable: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).unreadable = unreadable;
    }

    pub fn current(&self) -> TrafficSample {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).sample
    }
}

impl TrafficCounters for SimCounters {
    fn sample(&mut self) -> Option<TrafficSample> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.unreadable {
            None
        } else {
            Some(inner.sample)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_can_go_dark() {
        let c = SimCounters::new();
        let mut reader = c.clone();
        c.add(5, 2);
        c.add(1, 0);
        assert_eq!(
            reader.sample(),
            Some(TrafficSample {
                tx_packets: 6,
                rx_packets: 2
            })
        );
        c.set_unreadable(true);
        assert_eq!(reader.sample(), None);
        assert_eq!(c.current().tx_packets, 6);
    }
}
