//! In-process isolated contexts and the origin-guarded channel between them.
//!
//! A [`Realm`] stands in for one isolated execution context (a document, a
//! sandboxed frame, a worker). It has an identity, an origin, and an inbox
//! served by a single delivery task, so inbound events are handled serially
//! and never on the sender's stack.
//!
//! [`RealmChannel`] is the direct transport between two realms. Inbound
//! events are forwarded only when both the sender identity and the origin
//! match expectations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tether_core::RealmId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelError, InboundListener, Listeners, Unsubscribe};

/// Wildcard origin: accept or target any origin.
pub const ANY_ORIGIN: &str = "*";

/// One delivered message, as seen by the receiving realm.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEvent {
    /// The posted value.
    pub data: Value,
    /// Origin of the sending realm.
    pub origin: String,
    /// Identity of the sending realm.
    pub source: RealmId,
}

struct RealmInner {
    id: RealmId,
    origin: String,
    inbox: mpsc::UnboundedSender<MessageEvent>,
    listeners: Arc<Listeners<MessageEvent>>,
    closed: AtomicBool,
}

/// Handle to an isolated context. Clones refer to the same realm.
///
/// Must be created inside a tokio runtime: construction spawns the delivery
/// task, which ends once every handle is dropped.
#[derive(Clone)]
pub struct Realm {
    inner: Arc<RealmInner>,
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Create a realm with a fresh identity.
    pub fn new(origin: impl Into<String>) -> Self {
        Self::with_id(RealmId::new(), origin)
    }

    /// Create a realm with a caller-chosen identity.
    pub fn with_id(id: RealmId, origin: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEvent>();
        let listeners: Arc<Listeners<MessageEvent>> = Arc::default();

        let delivery = Arc::clone(&listeners);
        let realm_id = id.clone();
        drop(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivered = delivery.dispatch(&event);
                trace!(realm = %realm_id, source = %event.source, delivered, "message delivered");
            }
        }));

        Self {
            inner: Arc::new(RealmInner {
                id,
                origin: origin.into(),
                inbox: tx,
                listeners,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// This realm's identity.
    pub fn id(&self) -> &RealmId {
        &self.inner.id
    }

    /// This realm's origin.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Post `data` into this realm on behalf of `sender`.
    ///
    /// Returns `Ok(false)` when `target_origin` is neither `*` nor this
    /// realm's origin; the message is dropped, as a browser would.
    pub fn post_message(
        &self,
        data: Value,
        sender: &Realm,
        target_origin: &str,
    ) -> Result<bool, ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if target_origin != ANY_ORIGIN && target_origin != self.inner.origin {
            debug!(
                target_origin,
                origin = %self.inner.origin,
                "target origin mismatch, message dropped"
            );
            return Ok(false);
        }
        let event = MessageEvent {
            data,
            origin: sender.inner.origin.clone(),
            source: sender.inner.id.clone(),
        };
        self.inner
            .inbox
            .send(event)
            .map_err(|_| ChannelError::Closed)?;
        Ok(true)
    }

    /// Subscribe to every event delivered to this realm.
    pub fn add_event_listener(
        &self,
        listener: Arc<dyn Fn(&MessageEvent) + Send + Sync>,
    ) -> Unsubscribe {
        self.inner.listeners.add(listener)
    }

    /// Number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Stop accepting messages and drop every listener.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.listeners.clear();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Channel from a local realm to a remote one.
#[derive(Clone, Debug)]
pub struct RealmChannel {
    local: Realm,
    remote: Realm,
    expected_origin: String,
    disable_source_check: bool,
}

impl RealmChannel {
    /// Channel from `local` to `remote`, accepting any origin.
    pub fn new(local: Realm, remote: Realm) -> Self {
        Self {
            local,
            remote,
            expected_origin: ANY_ORIGIN.to_owned(),
            disable_source_check: false,
        }
    }

    /// Restrict inbound traffic to `origin`; outbound messages target it too.
    #[must_use]
    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = origin.into();
        self
    }

    /// Accept inbound messages from any sender identity.
    ///
    /// For test setups where the sender handle is not the remote realm.
    #[must_use]
    pub fn without_source_check(mut self) -> Self {
        self.disable_source_check = true;
        self
    }

    /// The remote realm.
    pub fn remote(&self) -> &Realm {
        &self.remote
    }

    /// The local realm.
    pub fn local(&self) -> &Realm {
        &self.local
    }

    /// Send, surfacing local failures.
    pub fn try_send(&self, message: Value) -> Result<bool, ChannelError> {
        self.remote
            .post_message(message, &self.local, &self.expected_origin)
    }

    /// Whether an inbound event passes the source and origin guards.
    pub fn accepts(&self, event: &MessageEvent) -> bool {
        is_acceptable(
            event,
            self.remote.id(),
            &self.expected_origin,
            self.disable_source_check,
        )
    }
}

fn is_acceptable(
    event: &MessageEvent,
    remote: &RealmId,
    expected_origin: &str,
    disable_source_check: bool,
) -> bool {
    let source_ok = disable_source_check || event.source == *remote;
    let origin_ok = expected_origin == ANY_ORIGIN || event.origin == expected_origin;
    source_ok && origin_ok
}

impl Channel for RealmChannel {
    fn send(&self, message: Value) {
        match self.try_send(message) {
            Ok(true) => {}
            Ok(false) => trace!(remote = %self.remote.id(), "send dropped by origin filter"),
            Err(err) => debug!(remote = %self.remote.id(), error = %err, "send failed"),
        }
    }

    fn add_listener(&self, listener: InboundListener) -> Unsubscribe {
        let remote = self.remote.id().clone();
        let expected_origin = self.expected_origin.clone();
        let disable_source_check = self.disable_source_check;
        self.local
            .add_event_listener(Arc::new(move |event: &MessageEvent| {
                if is_acceptable(event, &remote, &expected_origin, disable_source_check) {
                    listener(&event.data);
                } else {
                    trace!(
                        source = %event.source,
                        origin = %event.origin,
                        "rejected message from unexpected sender"
                    );
                }
            }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
