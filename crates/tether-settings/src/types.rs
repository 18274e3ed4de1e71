//! Serializable bridge settings.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Tunables shared by host and guest bridges.
///
/// Serialized as camelCase JSON; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Per-call response window in milliseconds. `0` disables the timeout.
    pub call_timeout_ms: u64,
    /// Delay between guest handshake requests.
    pub handshake_interval_ms: u64,
    /// Give up after this many handshake requests. `None` retries forever.
    pub handshake_max_attempts: Option<u32>,
    /// Reject `call`/`broadcast` while not connected.
    pub enforce_connected: bool,
    /// Minimum level for [`tether_core::logging::init_subscriber`].
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            handshake_interval_ms: 100,
            handshake_max_attempts: None,
            enforce_connected: false,
            log_level: "warn".into(),
        }
    }
}

impl BridgeSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "handshakeIntervalMs must be positive".into(),
            ));
        }
        if self.handshake_max_attempts == Some(0) {
            return Err(SettingsError::InvalidValue(
                "handshakeMaxAttempts must be at least 1 (or null for unbounded)".into(),
            ));
        }
        if !tether_core::logging::is_valid_level(&self.log_level) {
            return Err(SettingsError::InvalidValue(format!(
                "unknown logLevel {:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}
