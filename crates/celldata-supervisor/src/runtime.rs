use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use tracing::{debug, info};

use crate::apn::ApnType;
use crate::collab::{Collaborators, TimerScheduler};
use crate::config::SupervisorConfig;
use crate::event::{Event, TimerToken};
use crate::notify::{Notification, ObserverId};
use crate::supervisor::{CapabilityRequest, DataSessionSupervisor, SessionSnapshot};

type Callback = Box<dyn FnMut(&Notification) + Send>;

/// Messages to the worker thread.
enum Inbound {
    Event(Event),
    Request {
        capability: ApnType,
        reply: Sender<CapabilityRequest>,
    },
    Release {
        capability: ApnType,
        reply: Sender<bool>,
    },
    Subscribe {
        callback: Callback,
        reply: Sender<ObserverId>,
    },
    Unsubscribe {
        id: ObserverId,
        reply: Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle for posting events to a running supervisor. This is
/// how collaborators report completions back.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Inbound>,
}

impl EventSender {
    pub fn post(&self, event: Event) -> anyhow::Result<()> {
        self.tx
            .send(Inbound::Event(event))
            .map_err(|e| anyhow::anyhow!("Failed to post event: {}", e))
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

/// Thread-safe handle to a supervisor running on its own worker thread.
///
/// The worker owns the [`DataSessionSupervisor`] and a deadline queue that
/// backs its timers. Events, capability requests and subscriptions arrive
/// over an unbounded crossbeam channel; collaborators running on the worker
/// may post to it without blocking. After every message the worker
/// publishes a [`SessionSnapshot`] that queries read without a round-trip.
///
/// Dropping the runtime shuts the worker down.
pub struct SupervisorRuntime {
    tx: Sender<Inbound>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SupervisorRuntime {
    /// Start the worker. `build` receives a sender for the new runtime and
    /// returns the collaborators the supervisor will own.
    pub fn spawn<F>(cfg: SupervisorConfig, build: F) -> Self
    where
        F: FnOnce(EventSender) -> Collaborators,
    {
        let (tx, rx) = unbounded();
        let collab = build(EventSender { tx: tx.clone() });
        let snapshot = Arc::new(Mutex::new(SessionSnapshot::default()));
        let snapshot_clone = snapshot.clone();

        let handle = thread::Builder::new()
            .name("celldata-worker".into())
            .spawn(move || runtime_worker(rx, cfg, collab, snapshot_clone))
            .expect("failed to spawn supervisor worker");

        Self {
            tx,
            snapshot,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn post(&self, event: Event) -> anyhow::Result<()> {
        self.tx
            .send(Inbound::Event(event))
            .map_err(|e| anyhow::anyhow!("Failed to post event: {}", e))
    }

    pub fn request_capability(&self, capability: ApnType) -> anyhow::Result<CapabilityRequest> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Inbound::Request { capability, reply })
            .map_err(|e| anyhow::anyhow!("Failed to request capability: {}", e))?;
        rx.recv()
            .map_err(|e| anyhow::anyhow!("Worker dropped capability request: {}", e))
    }

    pub fn release_capability(&self, capability: ApnType) -> anyhow::Result<bool> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Inbound::Release { capability, reply })
            .map_err(|e| anyhow::anyhow!("Failed to release capability: {}", e))?;
        rx.recv()
            .map_err(|e| anyhow::anyhow!("Worker dropped capability release: {}", e))
    }

    /// Register a notification callback. It runs on the worker thread.
    pub fn subscribe<F>(&self, f: F) -> anyhow::Result<ObserverId>
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Inbound::Subscribe {
                callback: Box::new(f),
                reply,
            })
            .map_err(|e| anyhow::anyhow!("Failed to subscribe: {}", e))?;
        rx.recv()
            .map_err(|e| anyhow::anyhow!("Worker dropped subscription: {}", e))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> anyhow::Result<bool> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Inbound::Unsubscribe { id, reply })
            .map_err(|e| anyhow::anyhow!("Failed to unsubscribe: {}", e))?;
        rx.recv()
            .map_err(|e| anyhow::anyhow!("Worker dropped unsubscribe: {}", e))
    }

    /// Latest published session snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shared handle to the snapshot for external polling.
    pub fn snapshot_handle(&self) -> Arc<Mutex<SessionSnapshot>> {
        self.snapshot.clone()
    }

    /// Stops the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Inbound::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SupervisorRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Deadline Queue ─────────────────────────────────────────────────────────

/// Pending timers of the worker, ordered by nothing in particular; there
/// are at most a handful.
#[derive(Debug, Default)]
struct TimerQueue {
    entries: Vec<(Instant, TimerToken)>,
}

impl TimerQueue {
    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(at, _)| *at).min()
    }

    /// Remove and return every token due at `now`, earliest first.
    fn take_due(&mut self, now: Instant) -> Vec<TimerToken> {
        let mut due: Vec<(Instant, TimerToken)> = Vec::new();
        self.entries.retain(|&(at, token)| {
            if at <= now {
                due.push((at, token));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, token)| (*at, token.id));
        due.into_iter().map(|(_, token)| token).collect()
    }
}

/// Longest delay the deadline queue accepts; longer requests are clamped.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// [`TimerScheduler`] backed by the worker's deadline queue.
struct QueueTimers {
    queue: Rc<RefCell<TimerQueue>>,
}

impl TimerScheduler for QueueTimers {
    fn schedule(&mut self, token: TimerToken, after: Duration) {
        let now = Instant::now();
        let at = now
            .checked_add(after.min(MAX_TIMER_DELAY))
            .unwrap_or(now);
        let mut queue = self.queue.borrow_mut();
        queue.entries.retain(|(_, t)| t.kind != token.kind);
        queue.entries.push((at, token));
    }

    fn cancel(&mut self, token: TimerToken) {
        self.queue.borrow_mut().entries.retain(|(_, t)| *t != token);
    }
}

fn runtime_worker(
    rx: Receiver<Inbound>,
    cfg: SupervisorConfig,
    collab: Collaborators,
    snapshot: Arc<Mutex<SessionSnapshot>>,
) {
    let queue = Rc::new(RefCell::new(TimerQueue::default()));
    let timers = QueueTimers {
        queue: queue.clone(),
    };
    let mut sup = DataSessionSupervisor::new(cfg, collab, Box::new(timers));
    publish(&snapshot, &sup);
    info!("supervisor worker started");

    loop {
        let deadline = queue.borrow().next_deadline();
        let msg = match deadline {
            Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };

        match msg {
            Some(Inbound::Event(event)) => sup.on_event(event),
            Some(Inbound::Request { capability, reply }) => {
                let _ = reply.send(sup.request_capability(capability));
            }
            Some(Inbound::Release { capability, reply }) => {
                let _ = reply.send(sup.release_capability(capability));
            }
            Some(Inbound::Subscribe { callback, reply }) => {
                let _ = reply.send(sup.subscribe(callback));
            }
            Some(Inbound::Unsubscribe { id, reply }) => {
                let _ = reply.send(sup.unsubscribe(id));
            }
            Some(Inbound::Shutdown) => break,
            None => {}
        }

        let due = queue.borrow_mut().take_due(Instant::now());
        for token in due {
            debug!(kind = ?token.kind, id = token.id, "timer fired");
            sup.on_event(Event::TimerFired(token));
        }
        publish(&snapshot, &sup);
    }
    info!(state = %sup.state(), "supervisor worker stopped");
}

fn publish(snapshot: &Arc<Mutex<SessionSnapshot>>, sup: &DataSessionSupervisor) {
    *snapshot.lock().unwrap_or_else(|e| e.into_inner()) = sup.snapshot();
}
