//! Synchronous named-event pub/sub.
//!
//! [`Emitter`] is both the dispatcher's internal fan-out and the bridge's
//! public event surface. Listener identity is `Arc` pointer identity:
//! registering the same `Arc` twice under one name coalesces, and
//! [`Emitter::off`] removes by that same `Arc`.
//!
//! `emit` takes a snapshot of the listener list and releases the lock before
//! invoking anything, so a listener may register, deregister or tear down
//! the owner re-entrantly.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    once: bool,
    listener: Listener<T>,
}

struct Registry<T> {
    listeners: Mutex<HashMap<String, Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn remove_id(&self, name: &str, id: u64) {
        let mut map = self.listeners.lock();
        if let Some(entries) = map.get_mut(name) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                let _ = map.remove(name);
            }
        }
    }
}

/// Named-event emitter. Cloning yields another handle to the same listeners.
pub struct Emitter<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.registry.listeners.lock();
        f.debug_struct("Emitter")
            .field("events", &map.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `name`.
    ///
    /// Returns `false` if this exact `Arc` was already registered for `name`.
    pub fn on(&self, name: &str, listener: Listener<T>) -> bool {
        let mut map = self.registry.listeners.lock();
        let entries = map.entry(name.to_owned()).or_default();
        if entries
            .iter()
            .any(|e| !e.once && std::ptr::addr_eq(Arc::as_ptr(&e.listener), Arc::as_ptr(&listener)))
        {
            return false;
        }
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry {
            id,
            once: false,
            listener,
        });
        true
    }

    /// Wrap `f` in a [`Listener`], register it, and return it for a later
    /// [`off`](Self::off).
    pub fn listen(&self, name: &str, f: impl Fn(&T) + Send + Sync + 'static) -> Listener<T> {
        let listener: Listener<T> = Arc::new(f);
        let _ = self.on(name, Arc::clone(&listener));
        listener
    }

    /// Remove `listener` from `name`. Returns whether it was registered.
    pub fn off(&self, name: &str, listener: &Listener<T>) -> bool {
        let mut map = self.registry.listeners.lock();
        let Some(entries) = map.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !std::ptr::addr_eq(Arc::as_ptr(&e.listener), Arc::as_ptr(listener)));
        let removed = entries.len() != before;
        if entries.is_empty() {
            let _ = map.remove(name);
        }
        removed
    }

    /// Resolve with the payload of the next `name` event.
    ///
    /// The registration is removed when it fires or when the returned future
    /// is dropped. Resolves to `None` if the registration is cleared by
    /// [`remove_all_listeners`](Self::remove_all_listeners) first.
    pub fn once(&self, name: &str) -> Once<T> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let listener: Listener<T> = Arc::new(move |payload: &T| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(payload.clone());
            }
        });
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push(Entry {
                id,
                once: true,
                listener,
            });
        Once {
            rx,
            registry: Arc::downgrade(&self.registry),
            name: name.to_owned(),
            id,
        }
    }

    /// Invoke every listener currently registered for `name`, in
    /// registration order. Returns how many were invoked.
    pub fn emit(&self, name: &str, payload: &T) -> usize {
        let snapshot: Vec<Listener<T>> = {
            let mut map = self.registry.listeners.lock();
            let Some(entries) = map.get_mut(name) else {
                return 0;
            };
            let snapshot = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                let _ = map.remove(name);
            }
            snapshot
        };
        for listener in &snapshot {
            listener(payload);
        }
        snapshot.len()
    }

    /// Number of listeners registered for `name`, one-shot ones included.
    pub fn listener_count(&self, name: &str) -> usize {
        self.registry
            .listeners
            .lock()
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Drop every registration without invoking any.
    pub fn remove_all_listeners(&self) {
        let drained: Vec<_> = self.registry.listeners.lock().drain().collect();
        // Dropped outside the lock: once-senders close their receivers here.
        drop(drained);
    }
}

/// Future returned by [`Emitter::once`].
pub struct Once<T> {
    rx: oneshot::Receiver<T>,
    registry: Weak<Registry<T>>,
    name: String,
    id: u64,
}

impl<T> Future for Once<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_id(&self.name, self.id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
