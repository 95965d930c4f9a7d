//! Wires the pipeline components together and owns their background routines.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::jobs::{JobManager, JobManagerDeps, StaleJobReaper};
use crate::monitor::PipelineMonitor;
use crate::rate_limit::RateLimiter;
use crate::task_queue::TaskQueue;

/// External collaborators the pipeline runs against.
pub type PipelineDeps = JobManagerDeps;

/// A running pipeline: limiter, task queue, job manager and monitor sharing
/// one set of stores, plus the stale-job reaper and the task and rate-limit
/// sweepers.
pub struct Pipeline {
    config: PipelineConfig,
    limiter: Arc<RateLimiter>,
    tasks: TaskQueue,
    manager: JobManager,
    monitor: PipelineMonitor,
    reaper: StaleJobReaper,
    token: CancellationToken,
    routines: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build every component and start the background routines.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PipelineConfig, deps: PipelineDeps) -> anyhow::Result<Self> {
        config
            .validate()
            .context("invalid pipeline configuration")?;

        let token = CancellationToken::new();
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let tasks = TaskQueue::new(config.tasks.clone());
        let monitor = PipelineMonitor::new(
            deps.jobs.clone(),
            deps.dead_letters.clone(),
            config.monitor.clone(),
        )
        .with_task_queue(tasks.clone());
        let reaper = StaleJobReaper::new(deps.jobs.clone(), config.reaper.clone());
        let manager =
            JobManager::with_parent_token(config.manager.clone(), limiter.clone(), deps, &token);

        let routines = vec![
            reaper.clone().spawn(token.child_token()),
            tasks.spawn_sweeper(token.child_token()),
            limiter.spawn_sweeper(token.child_token()),
        ];

        info!(
            max_batch_size = config.manager.max_batch_size,
            stale_after_secs = config.reaper.stale_after.as_secs(),
            task_retention_secs = config.tasks.retention.as_secs(),
            "pipeline started"
        );

        Ok(Self {
            config,
            limiter,
            tasks,
            manager,
            monitor,
            reaper,
            token,
            routines,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn monitor(&self) -> &PipelineMonitor {
        &self.monitor
    }

    pub fn reaper(&self) -> &StaleJobReaper {
        &self.reaper
    }

    /// Cancelled on shutdown. Running jobs observe it at their next batch.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop the background routines and signal running jobs to stop.
    pub async fn shutdown(self) {
        info!("pipeline shutting down");
        self.token.cancel();
        for handle in self.routines {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline routine ended abnormally");
            }
        }
        info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{catalog, fast_config};
    use crate::jobs::{InMemoryEntitySource, InMemoryJobStore, InMemoryResultSink};
    use crate::rate_limit::{Identity, PresetLimits, RatePreset};
    use opsflow_ai::{Classification, FnProvider};
    use std::time::Duration;

    fn deps() -> PipelineDeps {
        let store = InMemoryJobStore::arc();
        PipelineDeps {
            jobs: store.clone(),
            dead_letters: store,
            source: InMemoryEntitySource::arc(catalog(3)),
            provider: Arc::new(FnProvider::new("fixed", |_, _| Ok(Classification::new("x", 0.9)))),
            sink: Arc::new(InMemoryResultSink::new()),
        }
    }

    #[tokio::test]
    async fn starts_and_shuts_down() {
        let config = PipelineConfig {
            manager: fast_config(),
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(config, deps()).unwrap();
        assert!(!pipeline.cancellation_token().is_cancelled());
        assert_eq!(pipeline.monitor().queue_metrics().await.unwrap().backlog, 0);

        let token = pipeline.cancellation_token().clone();
        pipeline.shutdown().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_rate_limit_windows_are_swept() {
        let mut config = PipelineConfig {
            manager: fast_config(),
            ..PipelineConfig::default()
        };
        config.rate_limits = config
            .rate_limits
            .with_limit(RatePreset::Preview, PresetLimits::new(5, Duration::from_secs(60)))
            .with_sweep_interval(Duration::from_secs(300));
        let pipeline = Pipeline::start(config, deps()).unwrap();

        for i in 0..1000 {
            let id = Identity::User(format!("user-{i}"));
            assert!(pipeline.limiter().admit(&id, RatePreset::Preview).is_allowed());
        }
        assert_eq!(pipeline.limiter().tracked_windows(), 1000);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(pipeline.limiter().tracked_windows(), 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.manager.max_batch_size = 0;
        let err = Pipeline::start(config, deps()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid pipeline configuration"));
    }
}
