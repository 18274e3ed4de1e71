//! # tether-settings
//!
//! Configuration for Tether bridges, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **Settings file**: `$TETHER_SETTINGS` or `~/.tether/settings.json`,
//!    deep-merged over defaults
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::BridgeSettings;

use std::sync::OnceLock;

static SETTINGS: OnceLock<BridgeSettings> = OnceLock::new();

/// Process-wide settings, loaded on first access.
///
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static BridgeSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load settings, using defaults");
            BridgeSettings::default()
        })
    })
}

/// Install `settings` as the process-wide value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: BridgeSettings) -> std::result::Result<(), BridgeSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = BridgeSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = BridgeSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.call_timeout_ms, 5000);
        assert_eq!(settings.handshake_interval_ms, 100);
        assert_eq!(settings.handshake_max_attempts, None);
        assert!(!settings.enforce_connected);
        assert_eq!(settings.log_level, "warn");
    }
}
