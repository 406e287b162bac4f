//! Connection state and transition bookkeeping.
//!
//! Every state change goes through [`StateMachine::change_state`]. The new state is
//! recorded under a short lock; observers are invoked afterwards from a dispatcher
//! task so a callback can call back into the connection without deadlocking.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use super::lock;

pub const MAX_STATE_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Configuring,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Configuring => "configuring",
            DeviceState::Connected => "connected",
            DeviceState::Reconnecting => "reconnecting",
            DeviceState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: DeviceState,
    pub to: DeviceState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateStats {
    pub current: DeviceState,
    pub previous: DeviceState,
    pub transitions: u64,
    pub last_change: Option<DateTime<Utc>>,
}

/// Current and previous state with a bounded transition history.
#[derive(Debug)]
pub struct StateTracker {
    current: DeviceState,
    previous: DeviceState,
    transitions: u64,
    history: VecDeque<StateTransition>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: DeviceState::Disconnected,
            previous: DeviceState::Disconnected,
            transitions: 0,
            history: VecDeque::with_capacity(MAX_STATE_HISTORY),
        }
    }

    /// Move to `to`. Returns `None` if already there.
    pub fn transition(&mut self, to: DeviceState) -> Option<StateTransition> {
        if self.current == to {
            return None;
        }
        let t = StateTransition {
            from: self.current,
            to,
            timestamp: Utc::now(),
        };
        self.record(t.clone());
        Some(t)
    }

    /// Record a transition observed elsewhere.
    pub fn record(&mut self, t: StateTransition) {
        self.previous = t.from;
        self.current = t.to;
        self.transitions += 1;
        if self.history.len() >= MAX_STATE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(t);
    }

    pub fn current(&self) -> DeviceState {
        self.current
    }

    pub fn previous(&self) -> DeviceState {
        self.previous
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            current: self.current,
            previous: self.previous,
            transitions: self.transitions,
            last_change: self.history.back().map(|t| t.timestamp),
        }
    }
}

pub type StateObserver = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// [`StateTracker`] plus observer fan-out.
pub struct StateMachine {
    tracker: Mutex<StateTracker>,
    observer: Arc<Mutex<Option<StateObserver>>>,
    events: Option<mpsc::UnboundedSender<StateTransition>>,
    broadcast: broadcast::Sender<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Spawns the dispatcher on the current runtime. Outside a runtime observers are
    /// called inline, still after the state lock is released.
    pub fn new() -> Self {
        let observer: Arc<Mutex<Option<StateObserver>>> = Arc::new(Mutex::new(None));
        let (broadcast, _) = broadcast::channel(64);
        let events = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<StateTransition>();
                let observer = observer.clone();
                let fanout = broadcast.clone();
                handle.spawn(async move {
                    while let Some(t) = rx.recv().await {
                        deliver(&observer, &fanout, &t);
                    }
                    trace!("state dispatcher finished");
                });
                Some(tx)
            }
            Err(_) => None,
        };
        Self {
            tracker: Mutex::new(StateTracker::new()),
            observer,
            events,
            broadcast,
        }
    }

    pub fn change_state(&self, to: DeviceState) -> Option<StateTransition> {
        let t = lock(&self.tracker).transition(to)?;
        debug!("State change: {} -> {}", t.from, t.to);
        match &self.events {
            Some(tx) => {
                if tx.send(t.clone()).is_err() {
                    deliver(&self.observer, &self.broadcast, &t);
                }
            }
            None => deliver(&self.observer, &self.broadcast, &t),
        }
        Some(t)
    }

    pub fn current(&self) -> DeviceState {
        lock(&self.tracker).current()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        lock(&self.tracker).history()
    }

    pub fn stats(&self) -> StateStats {
        lock(&self.tracker).stats()
    }

    /// Replace the single observer slot.
    pub fn set_observer(&self, observer: Option<StateObserver>) {
        *lock(&self.observer) = observer;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.broadcast.subscribe()
    }
}

fn deliver(
    observer: &Mutex<Option<StateObserver>>,
    fanout: &broadcast::Sender<StateTransition>,
    t: &StateTransition,
) {
    let cb = lock(observer).clone();
    if let Some(cb) = cb {
        cb(t);
    }
    let _ = fanout.send(t.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tracker_bounds_history() {
        let mut t = StateTracker::new();
        assert!(t.transition(DeviceState::Disconnected).is_none());
        for i in 0..150 {
            let to = if i % 2 == 0 {
                DeviceState::Connecting
            } else {
                DeviceState::Disconnected
            };
            t.transition(to);
        }
        assert_eq!(t.history().len(), MAX_STATE_HISTORY);
        let s = t.stats();
        assert_eq!(s.transitions, 150);
        assert_eq!(s.current, DeviceState::Disconnected);
        assert_eq!(s.previous, DeviceState::Connecting);
    }

    #[tokio::test]
    async fn observer_may_reenter() {
        let sm = Arc::new(StateMachine::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let sm2 = sm.clone();
            let seen = seen.clone();
            sm.set_observer(Some(Arc::new(move |t: &StateTransition| {
                // Reading state from inside the callback must not block.
                seen.lock().unwrap().push((t.to, sm2.current()));
            })));
        }
        let mut rx = sm.subscribe();
        sm.change_state(DeviceState::Connecting);
        sm.change_state(DeviceState::Connected);
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("recv");
        assert_eq!(first.to, DeviceState::Connecting);
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("recv");
        assert_eq!(second.from, DeviceState::Connecting);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, DeviceState::Connecting);
    }
}
