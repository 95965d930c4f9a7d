//! Health evaluation against fixed thresholds.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Overall or per-check health. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub dlq_degraded: u64,
    pub dlq_unhealthy: u64,
    /// Item failure rate over the monitor window
    pub failure_rate_degraded: f64,
    pub failure_rate_unhealthy: f64,
    /// A running job silent for longer than this is reported stuck
    pub stale_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            dlq_degraded: 10,
            dlq_unhealthy: 100,
            failure_rate_degraded: 0.10,
            failure_rate_unhealthy: 0.50,
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

impl HealthThresholds {
    pub fn with_dlq(mut self, degraded: u64, unhealthy: u64) -> Self {
        self.dlq_degraded = degraded;
        self.dlq_unhealthy = unhealthy;
        self
    }

    pub fn with_failure_rate(mut self, degraded: f64, unhealthy: f64) -> Self {
        self.failure_rate_degraded = degraded;
        self.failure_rate_unhealthy = unhealthy;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn dead_letters(&self, total: u64) -> HealthCheck {
        let status = if total >= self.dlq_unhealthy {
            HealthStatus::Unhealthy
        } else if total >= self.dlq_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthCheck::new(
            "dead_letters",
            status,
            format!(
                "{total} dead-lettered items (degraded at {}, unhealthy at {})",
                self.dlq_degraded, self.dlq_unhealthy
            ),
        )
        .with_value(total as f64)
    }

    pub fn failure_rate(&self, failed: u64, processed: u64) -> HealthCheck {
        if processed == 0 {
            return HealthCheck::new("failure_rate", HealthStatus::Healthy, "no items processed in window");
        }
        let rate = failed as f64 / processed as f64;
        let status = if rate >= self.failure_rate_unhealthy {
            HealthStatus::Unhealthy
        } else if rate >= self.failure_rate_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthCheck::new(
            "failure_rate",
            status,
            format!("{failed} of {processed} items failed ({:.1}%)", rate * 100.0),
        )
        .with_value(rate)
    }

    /// `oldest_last_seen` is the oldest sign of life among running jobs.
    pub fn stale_running(
        &self,
        oldest_last_seen: Option<DateTime<Utc>>,
        running: usize,
        now: DateTime<Utc>,
    ) -> HealthCheck {
        let Some(seen) = oldest_last_seen else {
            return HealthCheck::new(
                "stale_jobs",
                HealthStatus::Healthy,
                format!("{running} running jobs"),
            );
        };
        let age = (now - seen).num_seconds().max(0);
        let status = if age as u64 > self.stale_after.as_secs() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthCheck::new(
            "stale_jobs",
            status,
            format!(
                "oldest running job last seen {age}s ago (limit {}s)",
                self.stale_after.as_secs()
            ),
        )
        .with_value(age as f64)
    }
}

/// Result of one health rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Overall status is the worst individual check.
    pub fn from_checks(checks: Vec<HealthCheck>, checked_at: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            checked_at,
        }
    }

    /// Checks that are not healthy.
    pub fn triggered(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| c.status != HealthStatus::Healthy)
    }
}
