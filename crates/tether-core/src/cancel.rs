//! One-shot cancellation token.
//!
//! Used by the bridge to abandon a pending connect wait when `close()` is
//! called. Callbacks run at most once in total and never while the token's
//! lock is held, so a callback may touch the token again.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::BridgeError;

type Callback = Box<dyn FnOnce(Option<&BridgeError>) + Send>;

#[derive(Default)]
struct State {
    cancelled: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// Cancellation token. Clones share state.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CancelToken")
            .field("cancelled", &state.cancelled)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl CancelToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`cancel`](Self::cancel) has run.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Cancel, invoking every registered callback with `reason`.
    ///
    /// Only the first call has any effect.
    pub fn cancel(&self, reason: Option<BridgeError>) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        for (_, callback) in callbacks {
            callback(reason.as_ref());
        }
    }

    /// Register `callback` to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately (with
    /// no reason) and the returned handle does nothing.
    pub fn on_cancel(
        &self,
        callback: impl FnOnce(Option<&BridgeError>) + Send + 'static,
    ) -> CancelRegistration {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            callback(None);
            return CancelRegistration { slot: None };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));
        CancelRegistration {
            slot: Some((Arc::clone(&self.state), id)),
        }
    }
}

/// Handle returned by [`CancelToken::on_cancel`].
///
/// Dropping it leaves the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping the registration keeps the callback; call unsubscribe to remove it"]
pub struct CancelRegistration {
    slot: Option<(Arc<Mutex<State>>, u64)>,
}

impl CancelRegistration {
    /// Remove the callback if it has not fired yet.
    pub fn unsubscribe(self) {
        if let Some((state, id)) = self.slot {
            state.lock().callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
