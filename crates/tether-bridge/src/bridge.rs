//! The bridge endpoint: handshake, calls and events over one [`Dispatcher`].
//!
//! A [`Bridge`] is a cheap handle around shared state. Protocol handlers hold
//! only a weak reference back to that state, so dropping every handle tears
//! the endpoint down even while the channel is still attached.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_channel::Channel;
use tether_core::{
    BridgeError, BridgeRole, BridgeStatus, CallMessage, CancelToken, Emitter, Envelope,
    ErrorBody, EventMessage, Listener, MessageKind, Once, RequestId, ResponseMessage, SessionId,
};
use tether_settings::BridgeSettings;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::handshake::{RetryOutcome, Session, Transition, retry_handshake};
use crate::methods::{MethodHandler, MethodRegistry};
use crate::pending::{PendingCalls, Reply};

/// Local event emitted when the handshake completes.
pub const CONNECTED_EVENT: &str = "connected";

/// Memoized handshake wait shared by every concurrent `connect()`.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

#[derive(Default)]
struct BridgeState {
    session: Session,
    connection: Option<ConnectFuture>,
    close_cancel: Option<CancelToken>,
    handshake_task: Option<JoinHandle<()>>,
}

struct BridgeInner {
    role: BridgeRole,
    config: BridgeConfig,
    dispatcher: Dispatcher,
    methods: Arc<MethodRegistry>,
    events: Emitter<Value>,
    lifecycle: Emitter<SessionId>,
    pending: PendingCalls,
    state: Mutex<BridgeState>,
}

/// One side of a bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.state.lock().session;
        f.debug_struct("Bridge")
            .field("role", &self.inner.role)
            .field("status", &session.status)
            .field("session_id", &session.id)
            .field("pending_calls", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Host side: answers handshakes started by a guest.
    pub fn host(
        channel: impl Channel + 'static,
        config: BridgeConfig,
        methods: MethodRegistry,
    ) -> Self {
        Self::builder(BridgeRole::Host, channel)
            .config(config)
            .methods(methods)
            .build()
    }

    /// Guest side: starts and retries the handshake.
    pub fn guest(
        channel: impl Channel + 'static,
        config: BridgeConfig,
        methods: MethodRegistry,
    ) -> Self {
        Self::builder(BridgeRole::Guest, channel)
            .config(config)
            .methods(methods)
            .build()
    }

    /// Start building a bridge for `role` over `channel`.
    pub fn builder(role: BridgeRole, channel: impl Channel + 'static) -> BridgeBuilder {
        BridgeBuilder {
            role,
            channel: Arc::new(channel),
            config: BridgeConfig::default(),
            methods: MethodRegistry::new(),
        }
    }

    /// Establish a session with the peer.
    ///
    /// Concurrent calls share one attempt; once connected the returned future
    /// is already resolved. Resolves `Err(Closed)` when [`close`](Self::close)
    /// interrupts the wait. Must be called inside a tokio runtime.
    pub fn connect(&self) -> ConnectFuture {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if let Some(connection) = &state.connection {
            return connection.clone();
        }

        let token = CancelToken::new();
        let connection = wait_for_connection(inner.lifecycle.once(CONNECTED_EVENT), &token);
        state.connection = Some(connection.clone());
        state.close_cancel = Some(token.clone());

        if !inner.dispatcher.is_open() {
            inner.attach_handlers();
            let _ = inner.dispatcher.open();
        }

        match inner.role {
            BridgeRole::Host => {
                state.session.await_peer();
                debug!(role = %inner.role, "waiting for handshake request");
            }
            BridgeRole::Guest => {
                let session = state.session.begin_attempt();
                debug!(role = %inner.role, session_id = %session, "starting handshake");
                state.handshake_task = Some(inner.spawn_handshake(session, token));
            }
        }
        connection
    }

    /// Tear the session down and return to idle.
    ///
    /// Interrupts a pending `connect()`, stops handshake retries, detaches
    /// from the channel and rejects every in-flight call with `Closed`.
    pub fn close(&self) {
        let inner = &self.inner;
        let (token, task) = {
            let mut state = inner.state.lock();
            state.session.reset();
            state.connection = None;
            (state.close_cancel.take(), state.handshake_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(token) = token {
            token.cancel(Some(BridgeError::Closed));
        }
        inner.dispatcher.close();
        let rejected = inner.pending.reject_all(&BridgeError::Closed);
        info!(role = %inner.role, rejected, "bridge closed");
    }

    /// Invoke `method` on the peer.
    ///
    /// The call is sent immediately and its timeout runs from that moment;
    /// the returned future only waits for the answer. Dropping it forgets the
    /// call.
    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, BridgeError>> + Send + use<> {
        let inner = Arc::clone(&self.inner);
        let started = inner.start_call(method, args).map(|(request_id, reply, deadline)| {
            let guard = PendingGuard {
                inner: Arc::clone(&inner),
                request_id,
            };
            (guard, reply, deadline)
        });
        let method = method.to_owned();
        async move {
            let (guard, reply, deadline) = started?;
            let request_id = guard.request_id;
            let settled = match deadline {
                Some(deadline) => {
                    if let Ok(settled) = tokio::time::timeout_at(deadline, reply).await {
                        settled
                    } else {
                        let timeout_ms = inner.config.call_timeout_ms();
                        warn!(method, %request_id, timeout_ms, "call timed out");
                        return Err(BridgeError::CallTimeout { method, timeout_ms });
                    }
                }
                None => reply.await,
            };
            settled.unwrap_or(Err(BridgeError::Closed))
        }
    }

    /// [`call`](Self::call) and decode the result as `R`.
    pub fn call_as<R: DeserializeOwned + 'static>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<R, BridgeError>> + Send + use<R> {
        let call = self.call(method, args);
        let method = method.to_owned();
        async move {
            let value = call.await?;
            serde_json::from_value(value).map_err(|e| BridgeError::Decode {
                method,
                message: e.to_string(),
            })
        }
    }

    /// Send `event` with `payload` to the peer's listeners.
    pub fn broadcast(&self, event: &str, payload: Value) -> Result<(), BridgeError> {
        let session = self.inner.outbound_session()?;
        trace!(session_id = %session, event, "broadcasting event");
        self.inner.dispatcher.emit_to_remote(session, event, payload);
        Ok(())
    }

    /// Listen for remote `event`s (and the local `connected` event).
    pub fn on(&self, event: &str, listener: Listener<Value>) -> bool {
        self.inner.events.on(event, listener)
    }

    /// Register a closure and return its handle for [`off`](Self::off).
    pub fn listen(
        &self,
        event: &str,
        f: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Listener<Value> {
        self.inner.events.listen(event, f)
    }

    /// Remove a listener registered with [`on`](Self::on) or [`listen`](Self::listen).
    pub fn off(&self, event: &str, listener: &Listener<Value>) -> bool {
        self.inner.events.off(event, listener)
    }

    /// Resolve with the payload of the next `event`.
    pub fn once(&self, event: &str) -> Once<Value> {
        self.inner.events.once(event)
    }

    /// Listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> BridgeStatus {
        self.inner.state.lock().session.status
    }

    /// Whether the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.status() == BridgeStatus::Connected
    }

    /// Session currently negotiated or active.
    pub fn session_id(&self) -> SessionId {
        self.inner.state.lock().session.id
    }

    /// Which side this is.
    pub fn role(&self) -> BridgeRole {
        self.inner.role
    }

    /// Outbound calls awaiting an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// When the soonest pending call times out, if any call has a timeout.
    pub fn next_call_deadline(&self) -> Option<Instant> {
        self.inner.pending.next_deadline()
    }

    /// Runtime tunables.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Locally exposed methods.
    pub fn methods(&self) -> &MethodRegistry {
        &self.inner.methods
    }
}

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
    role: BridgeRole,
    channel: Arc<dyn Channel>,
    config: BridgeConfig,
    methods: MethodRegistry,
}

impl BridgeBuilder {
    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Derive the config from loaded settings.
    #[must_use]
    pub fn settings(mut self, settings: &BridgeSettings) -> Self {
        self.config = BridgeConfig::from(settings);
        self
    }

    /// Expose `methods` to the peer.
    #[must_use]
    pub fn methods(mut self, methods: MethodRegistry) -> Self {
        self.methods = methods;
        self
    }

    /// Expose one more method.
    #[must_use]
    pub fn method(mut self, name: &str, handler: impl MethodHandler + 'static) -> Self {
        self.methods.register(name, handler);
        self
    }

    /// Expose a synchronous closure.
    #[must_use]
    pub fn method_fn<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, ErrorBody> + Send + Sync + 'static,
    {
        self.methods.register_fn(name, f);
        self
    }

    /// Finish. The method table is frozen from here on.
    pub fn build(self) -> Bridge {
        debug!(role = %self.role, methods = self.methods.len(), "bridge created");
        Bridge {
            inner: Arc::new(BridgeInner {
                role: self.role,
                config: self.config,
                dispatcher: Dispatcher::new(self.channel),
                methods: Arc::new(self.methods),
                events: Emitter::new(),
                lifecycle: Emitter::new(),
                pending: PendingCalls::new(),
                state: Mutex::new(BridgeState::default()),
            }),
        }
    }
}

impl BridgeInner {
    fn attach_handlers(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener: Listener<Envelope> = Arc::new(move |envelope: &Envelope| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(envelope);
            }
        });
        for kind in MessageKind::ALL {
            let _ = self.dispatcher.on(kind, Arc::clone(&listener));
        }
    }

    fn handle(self: &Arc<Self>, envelope: &Envelope) {
        match envelope {
            Envelope::HandshakeRequest(h) => self.on_handshake_request(h.session_id),
            Envelope::HandshakeResponse(h) => self.on_handshake_response(h.session_id),
            Envelope::HandshakeAck(h) => self.on_handshake_ack(h.session_id),
            Envelope::Call(call) => self.on_call(call),
            Envelope::Response(response) => self.on_response(response),
            Envelope::Event(event) => self.on_event(event),
        }
    }

    fn on_handshake_request(&self, session: SessionId) {
        let transition = self.state.lock().session.on_request(self.role, session);
        if transition == Transition::Respond {
            debug!(session_id = %session, "accepting handshake request");
            self.dispatcher.handshake_response(session);
        } else {
            debug!(role = %self.role, session_id = %session, "ignoring handshake request");
        }
    }

    fn on_handshake_response(&self, session: SessionId) {
        let (transition, task) = {
            let mut state = self.state.lock();
            let transition = state.session.on_response(self.role, session);
            let task = if transition == Transition::Established {
                state.handshake_task.take()
            } else {
                None
            };
            (transition, task)
        };
        if let Some(task) = task {
            task.abort();
        }
        match transition {
            Transition::Established => {
                self.dispatcher.handshake_ack(session);
                self.established(session);
            }
            Transition::Reacknowledge => {
                debug!(session_id = %session, "duplicate handshake response, re-acknowledging");
                self.dispatcher.handshake_ack(session);
            }
            Transition::Respond | Transition::Ignore => {
                debug!(role = %self.role, session_id = %session, "ignoring handshake response");
            }
        }
    }

    fn on_handshake_ack(&self, session: SessionId) {
        let transition = self.state.lock().session.on_ack(self.role, session);
        if transition == Transition::Established {
            self.established(session);
        } else {
            debug!(role = %self.role, session_id = %session, "ignoring handshake ack");
        }
    }

    fn established(&self, session: SessionId) {
        info!(role = %self.role, session_id = %session, "bridge connected");
        let _ = self.lifecycle.emit(CONNECTED_EVENT, &session);
        let _ = self.events.emit(CONNECTED_EVENT, &Value::Null);
    }

    fn on_call(self: &Arc<Self>, call: &CallMessage) {
        if !self.accepts(call.session_id) {
            debug!(session_id = %call.session_id, method = %call.method_name, "dropping call from stale session");
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                let call = call.clone();
                drop(runtime.spawn(async move { inner.answer(call).await }));
            }
            Err(_) => {
                warn!(method = %call.method_name, "no async runtime to run method");
                self.dispatcher.respond_to_remote(
                    call.session_id,
                    call.request_id,
                    Err(ErrorBody::new("RuntimeUnavailable", "no async runtime to run the method")),
                );
            }
        }
    }

    async fn answer(&self, call: CallMessage) {
        let CallMessage {
            session_id,
            request_id,
            method_name,
            args,
        } = call;
        debug!(%session_id, %request_id, method = %method_name, "invoking local method");
        let outcome = self.methods.invoke(&method_name, args).await;
        if let Err(err) = &outcome {
            debug!(%request_id, method = %method_name, error = %err, "local method failed");
        }
        self.dispatcher.respond_to_remote(session_id, request_id, outcome);
    }

    fn on_response(&self, response: &ResponseMessage) {
        let request_id = response.request_id;
        if !self.accepts(response.session_id) {
            debug!(session_id = %response.session_id, %request_id, "dropping response from stale session");
            return;
        }
        if !self.pending.resolve(request_id, response.clone().into_outcome()) {
            debug!(%request_id, "response for unknown or settled call");
        }
    }

    fn on_event(&self, event: &EventMessage) {
        if !self.accepts(event.session_id) {
            debug!(session_id = %event.session_id, event = %event.event_name, "dropping event from stale session");
            return;
        }
        let delivered = self.events.emit(&event.event_name, &event.payload);
        trace!(event = %event.event_name, delivered, "remote event");
    }

    fn accepts(&self, session: SessionId) -> bool {
        self.state.lock().session.accepts(session)
    }

    /// Session to tag outbound traffic with, honoring `enforce_connected`.
    fn outbound_session(&self) -> Result<SessionId, BridgeError> {
        let session = self.state.lock().session;
        if self.config.enforce_connected && session.status != BridgeStatus::Connected {
            return Err(BridgeError::InvalidState {
                expected: BridgeStatus::Connected,
                actual: session.status,
            });
        }
        Ok(session.id)
    }

    fn start_call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(RequestId, Reply, Option<Instant>), BridgeError> {
        let session = self.outbound_session()?;
        let deadline = self.config.call_timeout.map(|limit| Instant::now() + limit);
        let request_id = self.dispatcher.next_request_id();
        let reply = self.pending.register(request_id, method, deadline);
        debug!(session_id = %session, %request_id, method, "calling remote method");
        self.dispatcher.send_call(session, request_id, method, args);
        Ok((request_id, reply, deadline))
    }

    fn spawn_handshake(self: &Arc<Self>, session: SessionId, token: CancelToken) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.handshake_interval;
        let max_attempts = self.config.handshake_max_attempts;
        tokio::spawn(async move {
            let outcome = retry_handshake(
                interval,
                max_attempts,
                &token,
                || {
                    weak.upgrade()
                        .is_some_and(|inner| inner.state.lock().session.is_negotiating(session))
                },
                |attempt| {
                    if let Some(inner) = weak.upgrade() {
                        trace!(session_id = %session, attempt, "sending handshake request");
                        inner.dispatcher.handshake_request(session);
                    }
                },
            )
            .await;
            if let RetryOutcome::Exhausted { attempts } = outcome {
                if let Some(inner) = weak.upgrade() {
                    inner.abandon_handshake(session, attempts, &token);
                }
            }
        })
    }

    fn abandon_handshake(&self, session: SessionId, attempts: u32, token: &CancelToken) {
        {
            let mut state = self.state.lock();
            if !state.session.is_negotiating(session) {
                return;
            }
            state.session.reset();
            state.connection = None;
            state.close_cancel = None;
            state.handshake_task = None;
        }
        warn!(session_id = %session, attempts, "handshake abandoned, peer never answered");
        token.cancel(Some(BridgeError::HandshakeExhausted { attempts }));
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().handshake_task.take() {
            task.abort();
        }
    }
}

/// Removes a call's table entry when its future ends, however it ends.
struct PendingGuard {
    inner: Arc<BridgeInner>,
    request_id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self.inner.pending.remove(self.request_id);
    }
}

fn wait_for_connection(connected: Once<SessionId>, token: &CancelToken) -> ConnectFuture {
    let (tx, rx) = oneshot::channel::<BridgeError>();
    let registration = token.on_cancel(move |reason| {
        let _ = tx.send(reason.cloned().unwrap_or(BridgeError::Closed));
    });
    async move {
        let outcome = tokio::select! {
            session = connected => session.map(|_| ()).ok_or(BridgeError::Closed),
            reason = rx => Err(reason.unwrap_or(BridgeError::Closed)),
        };
        registration.unsubscribe();
        outcome
    }
    .boxed()
    .shared()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
