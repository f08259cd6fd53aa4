//! Tracing/logging initialization.
//!
//! JSON lines on stderr, filtered through `RUST_LOG`. The sync engine logs
//! with structured fields (`entity`, `op_id`, `correlation_id`) so a drain can
//! be followed operation by operation.

use tracing_subscriber::EnvFilter;

/// Build the filter from `RUST_LOG`, falling back to `default_directive`.
pub fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
