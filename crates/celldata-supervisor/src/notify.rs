//! Outbound notifications and the observer registry.

use serde::Serialize;

use crate::apn::ApnType;
use crate::cause::FailCause;
use crate::event::Reason;
use crate::slot::NetworkParams;
use crate::supervisor::SessionState;

/// Direction of recent traffic, as seen by the stall poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    None,
    DataIn,
    DataOut,
    DataInOut,
}

/// Session status published with every data-connection notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub reason: Reason,
    pub state: SessionState,
    pub apn_types: Vec<ApnType>,
    pub apn: Option<String>,
    pub network: Option<NetworkParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    DataConnection(SessionStatus),
    StateTransition {
        from: SessionState,
        to: SessionState,
    },
    /// A setup attempt failed with a cause worth surfacing.
    SetupFailed { reason: Reason, cause: FailCause },
    DataActivity { activity: Activity },
}

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&Notification) + Send>;

/// Ordered list of notification callbacks keyed by subscription id.
#[derive(Default)]
pub struct Observers {
    next_id: u64,
    entries: Vec<(ObserverId, Callback)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, f: F) -> ObserverId
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push((id, Box::new(f)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(eid, _)| *eid != id);
        self.entries.len() != before
    }

    pub fn notify(&mut self, n: &Notification) {
        for (_, cb) in self.entries.iter_mut() {
            cb(n);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn subscribers_receive_in_order_until_unsubscribed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut obs = Observers::new();

        let l1 = log.clone();
        let a = obs.subscribe(move |_| l1.lock().unwrap().push("a"));
        let l2 = log.clone();
        obs.subscribe(move |_| l2.lock().unwrap().push("b"));

        let n = Notification::DataActivity {
            activity: Activity::DataIn,
        };
        obs.notify(&n);
        assert!(obs.unsubscribe(a));
        assert!(!obs.unsubscribe(a));
        obs.notify(&n);

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b"]);
        assert_eq!(obs.len(), 1);
    }
}
