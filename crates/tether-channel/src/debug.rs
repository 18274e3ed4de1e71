//! Logging decorator for any [`Channel`].
//!
//! Outbound messages are logged on `send`. Inbound messages are logged by a
//! single inner listener that lives exactly as long as at least one outer
//! subscriber does, so wrapping never duplicates inbound log lines.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::{Channel, InboundListener, Unsubscribe};

/// Log sink: `(direction, message)` where direction is `"outgoing message"`
/// or `"incoming message"`.
pub type DebugLogger = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Default)]
struct Subscription {
    count: usize,
    listener: Option<Unsubscribe>,
}

/// Wraps a channel and logs every message through it.
pub struct DebugChannel<C> {
    channel: Arc<C>,
    logger: DebugLogger,
    subscription: Arc<Mutex<Subscription>>,
}

impl<C: Channel + 'static> DebugChannel<C> {
    /// Wrap `channel`, logging through `tracing` at debug level.
    pub fn new(channel: C) -> Self {
        Self::with_logger(
            channel,
            Arc::new(|direction: &str, message: &Value| {
                tracing::debug!(target: "tether_channel::debug", %message, "{direction}");
            }),
        )
    }

    /// Wrap `channel` with a custom log sink.
    pub fn with_logger(channel: C, logger: DebugLogger) -> Self {
        Self {
            channel: Arc::new(channel),
            logger,
            subscription: Arc::default(),
        }
    }

    /// The wrapped channel.
    pub fn inner(&self) -> &C {
        &self.channel
    }
}

impl<C: Channel + 'static> Channel for DebugChannel<C> {
    fn send(&self, message: Value) {
        (self.logger)("outgoing message", &message);
        self.channel.send(message);
    }

    fn add_listener(&self, listener: InboundListener) -> Unsubscribe {
        {
            let mut sub = self.subscription.lock();
            if sub.count == 0 {
                let logger = Arc::clone(&self.logger);
                sub.listener = Some(self.channel.add_listener(Arc::new(move |message: &Value| {
                    logger("incoming message", message);
                })));
            }
            sub.count += 1;
        }

        let inner = self.channel.add_listener(listener);
        let subscription = Arc::clone(&self.subscription);
        Unsubscribe::new(move || {
            inner.unsubscribe();
            let last = {
                let mut sub = subscription.lock();
                sub.count = sub.count.saturating_sub(1);
                if sub.count == 0 { sub.listener.take() } else { None }
            };
            if let Some(debug_listener) = last {
                debug_listener.unsubscribe();
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
