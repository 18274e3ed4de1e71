//! Structured logging with `tracing`.
//!
//! Bridge internals log through `tracing` macros with structured fields
//! (`session_id`, `request_id`, `method`, `action`). Applications install a
//! subscriber once with [`init_subscriber`]; tests capture events with
//! [`capture_logs`].

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

/// Level names accepted by [`init_subscriber`] and the `logLevel` setting.
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Whether `level` names one of [`LEVELS`] (case-insensitive).
pub fn is_valid_level(level: &str) -> bool {
    LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

/// Initialize the global tracing subscriber with stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init fails once a global default exists
    let _ = subscriber.try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
