//! Outstanding outbound calls, keyed by request id.
//!
//! Each entry is a continuation: the method name (to rebuild remote errors),
//! the reply sender, and an optional deadline. An entry leaves the table
//! exactly once: on a matching response, on timeout, when the caller drops
//! the call future, or when the bridge closes.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{BridgeError, ErrorBody, RequestId};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Receives the settled outcome of one call.
pub type Reply = oneshot::Receiver<Result<Value, BridgeError>>;

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
    deadline: Option<Instant>,
}

/// The pending-call table.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<RequestId, PendingCall>>,
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.len())
            .finish()
    }
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register call `id`. Must happen before the call is sent.
    pub fn register(&self, id: RequestId, method: &str, deadline: Option<Instant>) -> Reply {
        let (tx, rx) = oneshot::channel();
        let _ = self.calls.lock().insert(
            id,
            PendingCall {
                method: method.to_owned(),
                reply: tx,
                deadline,
            },
        );
        rx
    }

    /// Settle `id` with a response outcome. Returns `false` if no such call
    /// is pending.
    pub fn resolve(&self, id: RequestId, outcome: Result<Value, ErrorBody>) -> bool {
        let Some(call) = self.calls.lock().remove(&id) else {
            return false;
        };
        let result = outcome.map_err(|body| BridgeError::from_remote(body, &call.method));
        let _ = call.reply.send(result);
        true
    }

    /// Forget `id` without settling it. Returns whether it was pending.
    pub fn remove(&self, id: RequestId) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Settle every pending call with `error`. Returns how many there were.
    pub fn reject_all(&self, error: &BridgeError) -> usize {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.reply.send(Err(error.clone()));
        }
        count
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: RequestId) -> bool {
        self.calls.lock().contains_key(&id)
    }

    /// Earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.lock().values().filter_map(|c| c.deadline).min()
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
