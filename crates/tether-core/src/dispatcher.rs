//! Named-event dispatcher.
//!
//! Listeners are stored per event name in insertion order. [`EventDispatcher::publish`]
//! takes a snapshot of the listener list and releases the lock before calling
//! anything, so a listener may subscribe, unsubscribe, or publish again while it
//! runs. Those changes only apply to later publishes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A registered listener callback.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Handle returned by [`EventDispatcher::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Synchronous named-event dispatcher carrying payloads of type `A`.
pub struct EventDispatcher<A> {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener<A>)>>>,
    next_id: AtomicU64,
}

impl<A> EventDispatcher<A> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `listener` for events named `name`.
    pub fn subscribe<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered under `name`.
    pub fn unsubscribe(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            let _ = listeners.remove(name);
        }
        removed
    }

    /// Call every listener currently registered for `name`, in insertion order.
    ///
    /// Returns the number of listeners invoked.
    pub fn publish(&self, name: &str, payload: &A) -> usize {
        let snapshot: Vec<Listener<A>> = match self.listeners.lock().get(name) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        for listener in &snapshot {
            listener(payload);
        }
        snapshot.len()
    }

    /// Number of listeners registered for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.lock().get(name).map_or(0, Vec::len)
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl<A> Default for EventDispatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for EventDispatcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let mut names: Vec<_> = listeners.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        names.sort();
        f.debug_struct("EventDispatcher")
            .field("listeners", &names)
            .finish()
    }
}
