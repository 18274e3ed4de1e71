//! # tether-channel
//!
//! The [`Channel`] abstraction the bridge speaks through, plus concrete
//! transports:
//!
//! - [`RealmChannel`]: direct context-to-context delivery between two
//!   [`Realm`]s, guarded by an origin allow-list and a sender identity check
//! - [`DebugChannel`]: decorator that logs every message in both directions
//! - [`StreamChannel`]: newline-delimited JSON over any async byte stream
//!
//! Channels are fire-and-forget and carry JSON values only. Inbound delivery
//! never happens on the sender's call stack.

#![deny(unsafe_code)]

pub mod channel;
pub mod debug;
pub mod realm;
pub mod stream;

pub use channel::{Channel, ChannelError, InboundListener, Listeners, Unsubscribe};
pub use debug::{DebugChannel, DebugLogger};
pub use realm::{MessageEvent, Realm, RealmChannel};
pub use stream::StreamChannel;
