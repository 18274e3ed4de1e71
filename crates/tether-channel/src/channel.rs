//! The transport seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

/// Callback invoked once per inbound message.
pub type InboundListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Errors a transport can hit locally. `send` itself never surfaces them.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport was shut down.
    #[error("channel closed")]
    Closed,
    /// Underlying I/O failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The message could not be encoded for the transport.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An unreliable, asynchronous, bidirectional message transport.
///
/// Implementations must deliver inbound messages asynchronously: a listener
/// is never invoked on the stack of the `send` that caused it.
pub trait Channel: Send + Sync {
    /// Send `message` to the peer. Fire-and-forget.
    fn send(&self, message: Value);

    /// Register `listener` for every inbound message.
    fn add_listener(&self, listener: InboundListener) -> Unsubscribe;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn send(&self, message: Value) {
        (**self).send(message);
    }

    fn add_listener(&self, listener: InboundListener) -> Unsubscribe {
        (**self).add_listener(listener)
    }
}

/// Removes exactly one listener registration.
#[must_use = "dropping an Unsubscribe leaves the listener registered"]
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    /// Wrap a removal closure.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle that removes nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Remove the registration.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Unsubscribe").field(&self.0.is_some()).finish()
    }
}

/// Listener list shared by transports.
///
/// Dispatch snapshots the list first, so listeners may unsubscribe (or add
/// others) from inside a callback.
pub struct Listeners<T: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    /// Register `listener`; the returned handle removes it.
    pub fn add(self: &Arc<Self>, listener: Arc<dyn Fn(&T) + Send + Sync>) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        let weak: Weak<Self> = Arc::downgrade(self);
        Unsubscribe::new(move || {
            if let Some(list) = weak.upgrade() {
                list.entries.lock().retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Invoke every listener with `item`. Returns how many ran.
    pub fn dispatch(&self, item: &T) -> usize {
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &snapshot {
            listener(item);
        }
        snapshot.len()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
