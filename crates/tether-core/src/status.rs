//! Bridge lifecycle status and role.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one bridge endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    /// No attempt in progress, or closed.
    #[default]
    Idle,
    /// A handshake step was sent or acknowledged; waiting for completion.
    Connecting,
    /// Handshake complete; calls and events may flow.
    Connected,
}

impl BridgeStatus {
    /// Lowercase name, as used in logs and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the handshake an endpoint plays.
///
/// The two roles have the same capabilities once connected; they differ only
/// in who initiates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeRole {
    /// The containing side. Waits for the guest's handshake request.
    Host,
    /// The contained side. Initiates and retries the handshake.
    Guest,
}

impl BridgeRole {
    /// Whether this role sends the handshake request.
    pub const fn initiates_handshake(self) -> bool {
        matches!(self, Self::Guest)
    }
}

impl fmt::Display for BridgeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
        }
    }
}
