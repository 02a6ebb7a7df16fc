//! Tracing subscriber setup for binaries and demos

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default` (e.g. `"info"` or `"hybrid_optimizer=debug"`).
///
/// Calling it more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
