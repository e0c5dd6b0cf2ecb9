//! Tracing/logging (shared setup).

/// Initialize process-wide tracing with JSON output and `RUST_LOG` filtering.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

pub use tracing::{LogFormat, LoggingConfig, init_with};

/// Tracing configuration (filters, formats).
pub mod tracing;
