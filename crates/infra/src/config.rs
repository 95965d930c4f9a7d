//! Pipeline configuration assembled from the environment.
//!
//! Every variable is optional. Unset variables keep the component default;
//! malformed ones are logged and ignored.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PIPELINE_DEFAULT_BATCH_SIZE` | 50 |
//! | `PIPELINE_MAX_BATCH_SIZE` | 200 |
//! | `PIPELINE_BATCH_DELAY_MS` | 0 |
//! | `PIPELINE_ITEM_MAX_ATTEMPTS` | 3 |
//! | `PIPELINE_ITEM_RETRY_BASE_MS` | 1000 |
//! | `PIPELINE_ITEM_RETRY_MAX_MS` | 30000 |
//! | `PIPELINE_MAX_RATE_LIMIT_WAIT_MS` | 5000 |
//! | `RATE_LIMIT_<PRESET>_MAX`, `RATE_LIMIT_<PRESET>_WINDOW_SECS` | per preset |
//! | `RATE_LIMIT_SWEEP_INTERVAL_SECS` | 60 |
//! | `TASK_RETENTION_SECS` | 3600 |
//! | `TASK_SWEEP_INTERVAL_SECS` | 60 |
//! | `JOB_STALE_TIMEOUT_SECS` | 900 |
//! | `JOB_REAPER_INTERVAL_SECS` | 60 |
//! | `HEALTH_DLQ_DEGRADED`, `HEALTH_DLQ_UNHEALTHY` | 10, 100 |
//! | `HEALTH_FAILURE_RATE_DEGRADED`, `HEALTH_FAILURE_RATE_UNHEALTHY` | 0.10, 0.50 |

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure};
use tracing::warn;

use crate::jobs::{JobManagerConfig, ReaperConfig};
use crate::monitor::MonitorConfig;
use crate::rate_limit::{RateLimitConfig, RatePreset};
use crate::task_queue::TaskQueueConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub manager: JobManagerConfig,
    pub rate_limits: RateLimitConfig,
    pub tasks: TaskQueueConfig,
    pub reaper: ReaperConfig,
    pub monitor: MonitorConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        let manager = &mut config.manager;
        env.set("PIPELINE_DEFAULT_BATCH_SIZE", &mut manager.default_batch_size);
        env.set("PIPELINE_MAX_BATCH_SIZE", &mut manager.max_batch_size);
        env.set_millis("PIPELINE_BATCH_DELAY_MS", &mut manager.batch_delay);
        env.set("PIPELINE_ITEM_MAX_ATTEMPTS", &mut manager.item_retry.max_attempts);
        env.set_millis("PIPELINE_ITEM_RETRY_BASE_MS", &mut manager.item_retry.base_delay);
        env.set_millis("PIPELINE_ITEM_RETRY_MAX_MS", &mut manager.item_retry.max_delay);
        env.set_millis("PIPELINE_MAX_RATE_LIMIT_WAIT_MS", &mut manager.max_rate_limit_wait);

        for preset in RatePreset::ALL {
            let mut limits = config.rate_limits.limits(preset);
            env.set(&format!("RATE_LIMIT_{}_MAX", preset.env_name()), &mut limits.max_requests);
            env.set_secs(&format!("RATE_LIMIT_{}_WINDOW_SECS", preset.env_name()), &mut limits.window);
            config.rate_limits = config.rate_limits.with_limit(preset, limits);
        }
        env.set_secs("RATE_LIMIT_SWEEP_INTERVAL_SECS", &mut config.rate_limits.sweep_interval);

        env.set_secs("TASK_RETENTION_SECS", &mut config.tasks.retention);
        env.set_secs("TASK_SWEEP_INTERVAL_SECS", &mut config.tasks.sweep_interval);

        env.set_secs("JOB_STALE_TIMEOUT_SECS", &mut config.reaper.stale_after);
        env.set_secs("JOB_REAPER_INTERVAL_SECS", &mut config.reaper.interval);

        let thresholds = &mut config.monitor.thresholds;
        thresholds.stale_after = config.reaper.stale_after;
        env.set("HEALTH_DLQ_DEGRADED", &mut thresholds.dlq_degraded);
        env.set("HEALTH_DLQ_UNHEALTHY", &mut thresholds.dlq_unhealthy);
        env.set("HEALTH_FAILURE_RATE_DEGRADED", &mut thresholds.failure_rate_degraded);
        env.set("HEALTH_FAILURE_RATE_UNHEALTHY", &mut thresholds.failure_rate_unhealthy);

        config
    }

    /// Reject combinations no component can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let m = &self.manager;
        ensure!(m.max_batch_size >= 1, "max batch size must be at least 1");
        ensure!(
            (1..=m.max_batch_size).contains(&m.default_batch_size),
            "default batch size {} is outside 1..={}",
            m.default_batch_size,
            m.max_batch_size
        );
        ensure!(m.item_retry.max_attempts >= 1, "item retry needs at least one attempt");

        for preset in RatePreset::ALL {
            if self.rate_limits.limits(preset).window.is_zero() {
                bail!("rate limit window for {preset} must be non-zero");
            }
        }
        ensure!(
            !self.rate_limits.sweep_interval.is_zero(),
            "rate-limit sweep interval must be non-zero"
        );
        ensure!(!self.tasks.sweep_interval.is_zero(), "task sweep interval must be non-zero");
        ensure!(!self.reaper.interval.is_zero(), "reaper interval must be non-zero");

        let t = &self.monitor.thresholds;
        ensure!(
            t.dlq_degraded <= t.dlq_unhealthy,
            "dead-letter degraded threshold exceeds unhealthy threshold"
        );
        ensure!(
            t.failure_rate_degraded <= t.failure_rate_unhealthy,
            "failure-rate degraded threshold exceeds unhealthy threshold"
        );
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "ignoring malformed configuration value");
                None
            }
        }
    }

    fn set<T: FromStr>(&self, key: &str, slot: &mut T) {
        if let Some(value) = self.parse(key) {
            *slot = value;
        }
    }

    fn set_millis(&self, key: &str, slot: &mut Duration) {
        if let Some(ms) = self.parse::<u64>(key) {
            *slot = Duration::from_millis(ms);
        }
    }

    fn set_secs(&self, key: &str, slot: &mut Duration) {
        if let Some(secs) = self.parse::<u64>(key) {
            *slot = Duration::from_secs(secs);
        }
    }
}
