//! Typed view over a raw [`Channel`].
//!
//! Inbound values are classified into [`Envelope`]s and re-emitted under
//! their [`MessageKind`]; anything that is not a protocol message is dropped.
//! Outbound helpers build the right envelope and hand it to the channel.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tether_channel::{Channel, Unsubscribe};
use tether_core::ids::IdSequence;
use tether_core::{
    Emitter, Envelope, ErrorBody, Listener, MessageKind, RequestId, SessionId, classify,
};
use tracing::{trace, warn};

/// Turns channel traffic into typed protocol events.
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    events: Emitter<Envelope>,
    ids: IdSequence,
    subscription: Mutex<Option<Unsubscribe>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Wrap `channel`. Nothing is received until [`open`](Self::open).
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            events: Emitter::new(),
            ids: IdSequence::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Attach to the channel. Returns `false` if already attached.
    pub fn open(&self) -> bool {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return false;
        }
        let events = self.events.clone();
        *subscription = Some(self.channel.add_listener(Arc::new(move |raw: &Value| {
            match classify(raw) {
                Some(envelope) => {
                    trace!(action = envelope.kind().as_str(), session_id = %envelope.session_id(), "inbound envelope");
                    let _ = events.emit(envelope.kind().as_str(), &envelope);
                }
                None => trace!("ignoring non-protocol message"),
            }
        })));
        true
    }

    /// Whether the channel listener is attached.
    pub fn is_open(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Detach from the channel and drop every local listener.
    pub fn close(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.events.remove_all_listeners();
    }

    /// Listen for inbound envelopes of `kind`.
    pub fn on(&self, kind: MessageKind, listener: Listener<Envelope>) -> bool {
        self.events.on(kind.as_str(), listener)
    }

    /// Stop listening for `kind` with `listener`.
    pub fn off(&self, kind: MessageKind, listener: &Listener<Envelope>) -> bool {
        self.events.off(kind.as_str(), listener)
    }

    /// Send a handshake request.
    pub fn handshake_request(&self, session_id: SessionId) {
        self.post(&Envelope::handshake_request(session_id));
    }

    /// Send a handshake response.
    pub fn handshake_response(&self, session_id: SessionId) {
        self.post(&Envelope::handshake_response(session_id));
    }

    /// Send a handshake acknowledgement.
    pub fn handshake_ack(&self, session_id: SessionId) {
        self.post(&Envelope::handshake_ack(session_id));
    }

    /// Allocate the id for the next outbound call.
    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_request_id()
    }

    /// Send a call under an id from [`next_request_id`](Self::next_request_id).
    pub fn send_call(
        &self,
        session_id: SessionId,
        request_id: RequestId,
        method: &str,
        args: Vec<Value>,
    ) {
        self.post(&Envelope::call(session_id, request_id, method, args));
    }

    /// Send a call under a fresh request id and return that id.
    pub fn call_on_remote(&self, session_id: SessionId, method: &str, args: Vec<Value>) -> RequestId {
        let request_id = self.next_request_id();
        self.send_call(session_id, request_id, method, args);
        request_id
    }

    /// Answer a call.
    pub fn respond_to_remote(
        &self,
        session_id: SessionId,
        request_id: RequestId,
        outcome: Result<Value, ErrorBody>,
    ) {
        self.post(&Envelope::response(session_id, request_id, outcome));
    }

    /// Send an event.
    pub fn emit_to_remote(&self, session_id: SessionId, event_name: &str, payload: Value) {
        self.post(&Envelope::event(session_id, event_name, payload));
    }

    fn post(&self, envelope: &Envelope) {
        match envelope.to_value() {
            Ok(value) => self.channel.send(value),
            Err(err) => warn!(action = envelope.kind().as_str(), error = %err, "failed to encode envelope"),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
