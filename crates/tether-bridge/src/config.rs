//! Runtime bridge configuration.

use std::time::Duration;

use tether_settings::BridgeSettings;

/// Tunables for one bridge endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Response window per call. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Delay between guest handshake requests.
    pub handshake_interval: Duration,
    /// Stop the guest handshake after this many requests. `None` retries forever.
    pub handshake_max_attempts: Option<u32>,
    /// Fail `call`/`broadcast` fast unless connected.
    pub enforce_connected: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&BridgeSettings::default())
    }
}

impl From<&BridgeSettings> for BridgeConfig {
    fn from(settings: &BridgeSettings) -> Self {
        Self {
            call_timeout: (settings.call_timeout_ms > 0)
                .then(|| Duration::from_millis(settings.call_timeout_ms)),
            handshake_interval: Duration::from_millis(settings.handshake_interval_ms.max(1)),
            handshake_max_attempts: settings.handshake_max_attempts.filter(|n| *n > 0),
            enforce_connected: settings.enforce_connected,
        }
    }
}

impl BridgeConfig {
    /// Set the call timeout; zero disables it.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the guest handshake retry interval.
    #[must_use]
    pub fn with_handshake_interval(mut self, interval: Duration) -> Self {
        self.handshake_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Bound the number of guest handshake requests.
    #[must_use]
    pub fn with_handshake_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.handshake_max_attempts = attempts.filter(|n| *n > 0);
        self
    }

    /// Require `Connected` for `call` and `broadcast`.
    #[must_use]
    pub fn with_enforce_connected(mut self, enforce: bool) -> Self {
        self.enforce_connected = enforce;
        self
    }

    /// Call timeout in whole milliseconds, for error messages.
    pub(crate) fn call_timeout_ms(&self) -> u64 {
        self.call_timeout
            .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
    }
}
