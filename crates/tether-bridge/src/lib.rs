//! # tether-bridge
//!
//! Session-oriented RPC and events between two isolated contexts.
//!
//! A [`Bridge`] sits on top of any [`Channel`](tether_channel::Channel). The
//! guest opens a session with a three-way handshake (request, response, ack)
//! that it retries until the host answers; after that each side can call
//! methods the other exposes and broadcast named events. Every envelope
//! carries the session id, so traffic from an abandoned session never reaches
//! application code.
//!
//! ```text
//! Bridge::call ──► Dispatcher ──► Channel ─ ─ ─► Channel ──► Dispatcher ──► Bridge ──► MethodRegistry
//!      ▲                                                                                   │
//!      └──────── PendingCalls ◄── Dispatcher ◄── Channel ◄─ ─ ─ Channel ◄── Dispatcher ◄───┘
//! ```

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod methods;
pub mod pending;

mod handshake;

pub use bridge::{Bridge, BridgeBuilder, CONNECTED_EVENT, ConnectFuture};
pub use config::BridgeConfig;
pub use dispatcher::Dispatcher;
pub use methods::{MethodHandler, MethodRegistry, parse_arg};
pub use pending::{PendingCalls, Reply};
pub use tether_core::{BridgeError, BridgeRole, BridgeStatus, ErrorBody, SessionId};
