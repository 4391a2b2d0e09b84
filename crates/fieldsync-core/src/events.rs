//! Observer lists with explicit unsubscribe handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    id: u64,
    gate: Arc<Gate>,
    listener: Listener<E>,
}

/// Delivery state of one listener: whether it is subscribed and which
/// threads are inside it right now.
struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct GateState {
    active: bool,
    running: Vec<ThreadId>,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                active: true,
                running: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the listener unless it has been unsubscribed.
    fn enter(&self) -> Option<Delivery<'_>> {
        let mut state = self.lock();
        if !state.active {
            return None;
        }
        state.running.push(thread::current().id());
        Some(Delivery(self))
    }

    /// Deactivate, then wait until no other thread is inside the listener.
    /// A listener unsubscribing itself does not wait on its own call.
    fn close(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        state.active = false;
        while state.running.iter().any(|thread| *thread != me) {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_active(&self) -> bool {
        self.lock().active
    }
}

/// Marks one thread inside a listener; leaving wakes a waiting `close`.
struct Delivery<'a>(&'a Gate);

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.0.lock();
        if let Some(index) = state.running.iter().position(|thread| *thread == me) {
            state.running.swap_remove(index);
        }
        drop(state);
        self.0.idle.notify_all();
    }
}

struct Registry<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<E>>>,
}

/// Fan-out of events of type `E` to registered listeners
pub struct Observers<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for Observers<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener; it stays registered until the handle is unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());
        self.lock().push(Entry {
            id,
            gate: Arc::clone(&gate),
            listener: Arc::new(listener),
        });

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            gate,
            detach: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry
                        .entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|entry| entry.id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every listener that is still subscribed.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot = self
            .lock()
            .iter()
            .map(|entry| (Arc::clone(&entry.gate), Arc::clone(&entry.listener)))
            .collect::<Vec<_>>();

        for (gate, listener) in snapshot {
            if let Some(_delivery) = gate.enter() {
                listener(event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<E>>> {
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by `subscribe`; listeners never run after `unsubscribe` returns
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    gate: Arc<Gate>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop delivery to this listener.
    ///
    /// Blocks until calls already running on other threads have returned.
    pub fn unsubscribe(mut self) {
        self.gate.close();
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
