//! Error taxonomy for the bridge.
//!
//! Only a name and a message survive the boundary: [`ErrorBody`] is what goes
//! on the wire, [`BridgeError`] is what callers see. Type and backtrace
//! information of the remote failure is not transported.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::BridgeStatus;

/// Wire name used for unknown-method failures.
pub const UNKNOWN_METHOD: &str = "UnknownMethod";
/// Wire name used for call timeouts.
pub const CALL_TIMEOUT: &str = "CallTimeout";
/// Wire name used for invalid-state failures.
pub const INVALID_STATE: &str = "InvalidState";
/// Wire name used when the bridge was closed underneath an operation.
pub const CLOSED: &str = "Closed";
/// Wire name used when the handshake gave up.
pub const HANDSHAKE_EXHAUSTED: &str = "HandshakeExhausted";
/// Wire name used when a result could not be decoded.
pub const DECODE_ERROR: &str = "DecodeError";
/// Wire name used when a local method panicked.
pub const PANIC: &str = "Panic";

/// Serializable `{name, message}` pair carried by a response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class name (e.g. `UnknownMethod`, `TypeError`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorBody {
    /// Build an error body.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Generic `Error` named body, for handlers that have nothing better.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<serde_json::Error> for ErrorBody {
    fn from(err: serde_json::Error) -> Self {
        Self::new("SerializationError", err.to_string())
    }
}

/// Errors surfaced by bridge operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The peer has no method registered under this name.
    #[error("Call to unknown method {method}")]
    UnknownMethod {
        /// The method that was requested.
        method: String,
    },

    /// No response arrived within the configured window.
    #[error("Call to remote method {method} timed out after {timeout_ms}ms")]
    CallTimeout {
        /// The method that was called.
        method: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The remote method failed.
    #[error("{name}: {message}")]
    Remote {
        /// Remote error class name.
        name: String,
        /// Remote error message.
        message: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("Bridge in invalid state. Expected {expected}, but actual state was {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: BridgeStatus,
        /// State the bridge was in.
        actual: BridgeStatus,
    },

    /// The bridge was closed while the operation was outstanding.
    #[error("Bridge has been closed")]
    Closed,

    /// The guest gave up on the handshake.
    #[error("Handshake abandoned after {attempts} attempts")]
    HandshakeExhausted {
        /// Number of handshake requests sent.
        attempts: u32,
    },

    /// A result arrived but did not match the expected shape.
    #[error("Failed to decode result of {method}: {message}")]
    Decode {
        /// The method whose result was decoded.
        method: String,
        /// Decoder message.
        message: String,
    },
}

impl BridgeError {
    /// Stable class name used when this error crosses the boundary.
    pub fn name(&self) -> &str {
        match self {
            Self::UnknownMethod { .. } => UNKNOWN_METHOD,
            Self::CallTimeout { .. } => CALL_TIMEOUT,
            Self::Remote { name, .. } => name,
            Self::InvalidState { .. } => INVALID_STATE,
            Self::Closed => CLOSED,
            Self::HandshakeExhausted { .. } => HANDSHAKE_EXHAUSTED,
            Self::Decode { .. } => DECODE_ERROR,
        }
    }

    /// Reduce to the `{name, message}` pair that goes on the wire.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            Self::Remote { name, message } => ErrorBody::new(name.clone(), message.clone()),
            other => ErrorBody::new(other.name(), other.to_string()),
        }
    }

    /// Rebuild a caller-facing error from a response's error body.
    ///
    /// `method` is the name the caller used; it lets an unknown-method reply
    /// come back as [`BridgeError::UnknownMethod`] rather than a generic remote
    /// failure.
    pub fn from_remote(body: ErrorBody, method: &str) -> Self {
        if body.name == UNKNOWN_METHOD {
            return Self::UnknownMethod {
                method: method.to_owned(),
            };
        }
        Self::Remote {
            name: body.name,
            message: body.message,
        }
    }

    /// Whether the call may be worth retrying by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CallTimeout { .. } | Self::Closed)
    }
}

impl From<ErrorBody> for BridgeError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote {
            name: body.name,
            message: body.message,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
