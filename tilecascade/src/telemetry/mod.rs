//! Logging setup.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedding application's business. This helper gives binaries and
//! integration tests a one-line default.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a formatted `tracing` subscriber.
///
/// `directives` is an env-filter expression (e.g. `"info"` or
/// `"tilecascade=debug"`); the `RUST_LOG` environment variable takes
/// precedence when set. Safe to call more than once: only the first call
/// installs a subscriber.
pub fn init_logging(directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
