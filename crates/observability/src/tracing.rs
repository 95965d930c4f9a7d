//! Tracing subscriber initialization.
//!
//! `RUST_LOG` takes precedence over the configured default filter.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset or invalid
    pub default_filter: String,
    pub json: bool,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: true,
            with_target: false,
        }
    }
}

impl TracingConfig {
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Human-readable output instead of JSON lines.
    pub fn pretty(mut self) -> Self {
        self.json = false;
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed, in which case nothing changes.
pub fn init(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
