//! Staleness reaper: fails `running` jobs whose runner stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opsflow_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::JobStatus;

/// Error message stamped on reaped jobs.
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// A running job with no heartbeat for this long is considered dead.
    pub stale_after: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(60),
        }
    }
}

impl ReaperConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Clone)]
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
}

impl std::fmt::Debug for StaleJobReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleJobReaper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StaleJobReaper {
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Fail every running job last seen before `now - stale_after`.
    ///
    /// Returns the ids that were reaped. Jobs that finished between the scan
    /// and the write are skipped.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - stale_after;

        let mut reaped = Vec::new();
        for job in self.store.list_stale_running(cutoff).await? {
            match self
                .store
                .finish(job.id, JobStatus::Failed, Some(HEARTBEAT_TIMEOUT.to_string()), now)
                .await
            {
                Ok(_) => {
                    warn!(
                        job_id = %job.id,
                        last_seen = ?job.last_seen(),
                        processed = job.processed_count,
                        "stale running job reaped"
                    );
                    reaped.push(job.id);
                }
                Err(JobStoreError::InvalidTransition { .. }) => {
                    debug!(job_id = %job.id, "job finished before it could be reaped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Run [`StaleJobReaper::reap_once`] every `interval` until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                stale_after_secs = self.config.stale_after.as_secs(),
                interval_secs = self.config.interval.as_secs(),
                "stale job reaper started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("stale job reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.reap_once(Utc::now()).await {
                            Ok(reaped) if !reaped.is_empty() => {
                                info!(count = reaped.len(), "reaper sweep finished");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "reaper sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
