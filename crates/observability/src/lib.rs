//! Process-wide tracing setup shared by the sync engine binaries.

/// Initialize process-wide tracing with the `info` default level.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing configuration (filters, formatter).
pub mod tracing;
