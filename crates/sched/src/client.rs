//! Connected callers and their outstanding work.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::WakeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection state.
pub struct ClientContext {
    id: ClientId,
    outstanding_execs: AtomicUsize,
    abort: AtomicBool,
    events: Mutex<u64>,
    event_cond: Condvar,
    /// Back-link used to wake the scheduler on abort.
    sched: Weak<WakeSignal>,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .field("outstanding_execs", &self.outstanding())
            .field("aborted", &self.is_aborted())
            .field("events", &self.events())
            .finish()
    }
}

impl ClientContext {
    pub(crate) fn new(sched: Weak<WakeSignal>) -> Self {
        Self {
            id: ClientId::new(),
            outstanding_execs: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            events: Mutex::new(0),
            event_cond: Condvar::new(),
            sched,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding_execs.load(Ordering::Acquire)
    }

    pub(crate) fn exec_submitted(&self) {
        self.outstanding_execs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exec_retired(&self) {
        // Saturate rather than wrap on a double decrement.
        let _ = self
            .outstanding_execs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Request teardown. Observed on the scheduler's next pass; queued jobs
    /// are aborted, running jobs are left to finish or time out.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        if let Some(sched) = self.sched.upgrade() {
            sched.poke();
        }
    }

    /// Completion events delivered so far.
    pub fn events(&self) -> u64 {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_event(&self) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        *events += 1;
        drop(events);
        self.event_cond.notify_all();
    }

    /// Block until more than `seen` events have been delivered. Returns the
    /// current count, which equals `seen` on timeout.
    pub fn wait_event(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while *events <= seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            events = self
                .event_cond
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *events
    }
}

/// All connected clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<ClientContext>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, sched: Weak<WakeSignal>) -> Arc<ClientContext> {
        let client = Arc::new(ClientContext::new(sched));
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id(), Arc::clone(&client));
        client
    }

    pub fn unregister(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientContext>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clients with at least one outstanding job.
    pub fn live_clients(&self) -> Vec<ClientId> {
        let mut live: Vec<_> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.outstanding() > 0)
            .map(|c| c.id())
            .collect();
        live.sort_by_key(|id| id.0);
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outstanding_counts() {
        let registry = ClientRegistry::new();
        let client = registry.register(Weak::new());
        client.exec_submitted();
        client.exec_submitted();
        assert_eq!(registry.live_clients(), vec![client.id()]);
        client.exec_retired();
        client.exec_retired();
        client.exec_retired();
        assert_eq!(client.outstanding(), 0);
        assert!(registry.live_clients().is_empty());
    }

    #[test]
    fn abort_without_scheduler_is_harmless() {
        let registry = ClientRegistry::new();
        let client = registry.register(Weak::new());
        client.abort();
        assert!(client.is_aborted());
    }

    #[test]
    fn abort_pokes_scheduler() {
        let signal = Arc::new(WakeSignal::new());
        let registry = ClientRegistry::new();
        let client = registry.register(Arc::downgrade(&signal));
        client.abort();
        let start = Instant::now();
        let wake = signal.wait(Some(Duration::from_secs(5)));
        assert!(!wake.stop);
        assert!(start.elapsed() < Duration::from_secs(1), "abort should wake the scheduler");
    }

    #[test]
    fn wait_event_sees_new_events() {
        let client = Arc::new(ClientContext::new(Weak::new()));
        let notifier = Arc::clone(&client);
        let t = std::thread::spawn(move || notifier.record_event());
        let seen = client.wait_event(0, Duration::from_secs(5));
        t.join().unwrap();
        assert_eq!(seen, 1);
        assert_eq!(client.wait_event(1, Duration::from_millis(5)), 1);
    }

    #[test]
    fn unregister_removes() {
        let registry = ClientRegistry::new();
        let client = registry.register(Weak::new());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(client.id()).is_some());
        registry.unregister(client.id());
        assert!(registry.is_empty());
    }
}
