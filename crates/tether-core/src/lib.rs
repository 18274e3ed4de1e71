//! # tether-core
//!
//! Foundation types shared by every Tether crate.
//!
//! Tether lets two isolated execution contexts (a host and a sandboxed guest)
//! talk over an asynchronous, best-effort message transport. This crate holds
//! the vocabulary both sides agree on:
//!
//! - **IDs**: numeric [`SessionId`] / [`RequestId`] and the string [`RealmId`]
//! - **Envelopes**: the closed [`Envelope`] enum, constructors and the [`classify`] guard
//! - **Errors**: [`BridgeError`] and the boundary-safe [`ErrorBody`]
//! - **Status**: [`BridgeStatus`] lifecycle states and [`BridgeRole`]
//! - **Emitter**: synchronous named-event pub/sub
//! - **Cancel token**: one-shot cancellation for in-flight waits
//! - **Logging**: `tracing` subscriber setup and capture helpers for tests

#![deny(unsafe_code)]

pub mod cancel;
pub mod emitter;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod status;

pub use cancel::{CancelRegistration, CancelToken};
pub use emitter::{Emitter, Listener, Once};
pub use errors::{BridgeError, ErrorBody};
pub use ids::{IdSequence, RealmId, RequestId, SessionId};
pub use messages::{
    CallMessage, Envelope, EventMessage, Handshake, MARKER, MessageKind, ResponseMessage,
    classify,
};
pub use status::{BridgeRole, BridgeStatus};
