//! Tracing and logging setup shared by pipeline processes.

pub mod tracing;

pub use self::tracing::TracingConfig;

/// Initialize process-wide tracing with the default configuration.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}
