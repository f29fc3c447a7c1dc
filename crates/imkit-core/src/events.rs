//! Publish/subscribe utility shared by `Realtime`, `IMClient` and conversations.
//!
//! Each entity owns one `EventEmitter<E>` over its own event enum. Listeners
//! are plain closures; emitting never holds the listener lock while a
//! listener runs, so a listener may subscribe or unsubscribe re-entrantly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Handle returned by `on`/`once`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<E> {
    id: ListenerId,
    once: bool,
    callback: Listener<E>,
}

pub struct EventEmitter<E> {
    listeners: RwLock<Vec<Entry<E>>>,
    next_id: AtomicU64,
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every event.
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(Arc::new(callback), false)
    }

    /// Subscribe to the next event only.
    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(Arc::new(callback), true)
    }

    /// Unsubscribe. Returns false if the listener was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Deliver an event to all listeners in subscription order.
    ///
    /// Returns true if at least one listener was invoked.
    pub fn emit(&self, event: &E) -> bool {
        let callbacks: Vec<Listener<E>> = {
            let mut listeners = self.listeners.write();
            let callbacks = listeners.iter().map(|e| Arc::clone(&e.callback)).collect();
            listeners.retain(|e| !e.once);
            callbacks
        };
        for callback in &callbacks {
            callback(event);
        }
        !callbacks.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    fn add(&self, callback: Listener<E>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Entry { id, once, callback });
        id
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
