//! Read-only views over pipeline state.
//!
//! Every query reads the stores directly. A store failure surfaces as
//! [`MonitorError::StoreUnavailable`] so an outage never looks like an idle
//! pipeline; [`PipelineMonitor::health`] instead folds it into an
//! `unhealthy` report.

pub mod health;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::jobs::{DeadLetterStore, Job, JobStore, JobStoreError};
use crate::task_queue::TaskQueue;

pub use health::{HealthCheck, HealthReport, HealthStatus, HealthThresholds};
pub use metrics::{
    DlqMetrics, ErrorMetrics, HourlyBucket, JobFailure, PerformanceMetrics, QueueMetrics,
    ReasonCount,
};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("pipeline store unavailable: {0}")]
    StoreUnavailable(#[from] JobStoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Trailing window for performance, error and health aggregates
    pub window: Duration,
    pub hourly_buckets: u32,
    /// Cap on reasons and failures listed in [`ErrorMetrics`]
    pub max_error_entries: usize,
    pub dashboard_recent_jobs: usize,
    pub thresholds: HealthThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 3600),
            hourly_buckets: 24,
            max_error_entries: 10,
            dashboard_recent_jobs: 20,
            thresholds: HealthThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Everything a status page needs in one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub generated_at: DateTime<Utc>,
    pub health: HealthReport,
    pub queue: QueueMetrics,
    pub performance: PerformanceMetrics,
    pub errors: ErrorMetrics,
    pub dead_letters: DlqMetrics,
    pub recent_jobs: Vec<Job>,
    pub hourly: Vec<HourlyBucket>,
}

#[derive(Clone)]
pub struct PipelineMonitor {
    jobs: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    tasks: Option<TaskQueue>,
    config: MonitorConfig,
}

impl std::fmt::Debug for PipelineMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMonitor")
            .field("config", &self.config)
            .field("tasks", &self.tasks.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineMonitor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            jobs,
            dead_letters,
            tasks: None,
            config,
        }
    }

    /// Include task counts in [`QueueMetrics`].
    pub fn with_task_queue(mut self, tasks: TaskQueue) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now - window
    }

    pub async fn queue_metrics(&self) -> Result<QueueMetrics, MonitorError> {
        let jobs = self.jobs.stats().await?;
        Ok(QueueMetrics::new(jobs, self.tasks.as_ref().map(TaskQueue::stats)))
    }

    pub async fn performance_metrics(&self) -> Result<PerformanceMetrics, MonitorError> {
        let finished = self.jobs.list_finished_since(self.window_start(Utc::now())).await?;
        Ok(PerformanceMetrics::from_finished(&finished, self.config.window.as_secs()))
    }

    pub async fn error_metrics(&self) -> Result<ErrorMetrics, MonitorError> {
        let since = self.window_start(Utc::now());
        let finished = self.jobs.list_finished_since(since).await?;
        let recent = self.dead_letters.summary_since(since).await?;
        Ok(ErrorMetrics::build(
            &finished,
            &recent,
            self.config.window.as_secs(),
            self.config.max_error_entries,
        ))
    }

    pub async fn dlq_metrics(&self) -> Result<DlqMetrics, MonitorError> {
        let summary = self.dead_letters.summary().await?;
        Ok(DlqMetrics::from_summary(summary, Utc::now()))
    }

    /// Newest first.
    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<Job>, MonitorError> {
        Ok(self.jobs.list_recent(limit).await?)
    }

    pub async fn hourly_stats(&self) -> Result<Vec<HourlyBucket>, MonitorError> {
        self.hourly_stats_at(Utc::now()).await
    }

    pub async fn hourly_stats_at(&self, now: DateTime<Utc>) -> Result<Vec<HourlyBucket>, MonitorError> {
        let hours = self.config.hourly_buckets.max(1);
        let since = now - chrono::Duration::hours(i64::from(hours));
        let created = self.jobs.list_created_since(since).await?;
        let finished = self.jobs.list_finished_since(since).await?;
        Ok(metrics::hourly_buckets(&created, &finished, now, hours))
    }

    /// Evaluate every health rule. Never fails: an unreachable store is
    /// itself an `unhealthy` check.
    pub async fn health(&self) -> HealthReport {
        self.health_at(Utc::now()).await
    }

    pub async fn health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let report = match self.evaluate(now).await {
            Ok(checks) => HealthReport::from_checks(checks, now),
            Err(e) => {
                warn!(error = %e, "health check could not reach the pipeline store");
                HealthReport::from_checks(
                    vec![HealthCheck::new("store", HealthStatus::Unhealthy, e.to_string())],
                    now,
                )
            }
        };
        debug!(status = %report.status, triggered = report.triggered().count(), "health evaluated");
        report
    }

    async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<HealthCheck>, JobStoreError> {
        let dlq = self.dead_letters.summary().await?;
        let finished = self.jobs.list_finished_since(self.window_start(now)).await?;
        let running = self.jobs.list_stale_running(now).await?;
        Ok(self.checks(dlq.total, &finished, &running, now))
    }

    fn checks(
        &self,
        dead_letters: u64,
        finished: &[Job],
        running: &[Job],
        now: DateTime<Utc>,
    ) -> Vec<HealthCheck> {
        let thresholds = &self.config.thresholds;
        let processed: u64 = finished.iter().map(|j| j.processed_count).sum();
        let failed: u64 = finished.iter().map(|j| j.failed_count).sum();
        let oldest_seen = running.iter().map(|j| j.last_seen().unwrap_or(j.created_at)).min();

        vec![
            HealthCheck::new("store", HealthStatus::Healthy, "reachable"),
            thresholds.dead_letters(dead_letters),
            thresholds.failure_rate(failed, processed),
            thresholds.stale_running(oldest_seen, running.len(), now),
        ]
    }

    /// All views in one snapshot.
    pub async fn dashboard(&self) -> Result<Dashboard, MonitorError> {
        let now = Utc::now();
        let since = self.window_start(now);

        let stats = self.jobs.stats().await?;
        let finished = self.jobs.list_finished_since(since).await?;
        let running = self.jobs.list_stale_running(now).await?;
        let summary = self.dead_letters.summary().await?;
        let recent_dead_letters = self.dead_letters.summary_since(since).await?;
        let recent_jobs = self.jobs.list_recent(self.config.dashboard_recent_jobs).await?;
        let hourly = self.hourly_stats_at(now).await?;
        let health = HealthReport::from_checks(self.checks(summary.total, &finished, &running, now), now);

        let window_secs = self.config.window.as_secs();
        Ok(Dashboard {
            generated_at: now,
            health,
            queue: QueueMetrics::new(stats, self.tasks.as_ref().map(TaskQueue::stats)),
            performance: PerformanceMetrics::from_finished(&finished, window_secs),
            errors: ErrorMetrics::build(
                &finished,
                &recent_dead_letters,
                window_secs,
                self.config.max_error_entries,
            ),
            dead_letters: DlqMetrics::from_summary(summary, now),
            recent_jobs,
            hourly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        BatchOutcome, CatalogFilter, CategorizeConfig, DeadLetterEntry, InMemoryJobStore, JobSpec,
        JobStatus,
    };
    use crate::task_queue::TaskQueueConfig;
    use opsflow_ai::CatalogItem;
    use opsflow_core::DeadLetterId;

    fn monitor(store: &Arc<InMemoryJobStore>) -> PipelineMonitor {
        PipelineMonitor::new(store.clone(), store.clone(), MonitorConfig::default())
    }

    async fn run_job(store: &InMemoryJobStore, ok: u64, failed: u64) -> Job {
        let job = Job::new(
            JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default()),
            10,
            "tester",
        )
        .with_total_items(ok + failed);
        let id = job.id;
        store.insert(job).await.unwrap();
        let now = Utc::now();
        let job = store.try_start(id, now).await.unwrap().unwrap();
        let outcome = BatchOutcome {
            succeeded: ok,
            failed,
            pending_review: 0,
        };
        store.record_batch(id, &outcome, now).await.unwrap();
        for i in 0..failed {
            let item = CatalogItem::new(format!("bad-{i}"));
            store
                .push(DeadLetterEntry::for_item(&job, &item, "inference failed: 503", 3))
                .await
                .unwrap();
        }
        let status = if failed == 0 { JobStatus::Completed } else { JobStatus::PartiallyFailed };
        store.finish(id, status, None, now).await.unwrap()
    }

    #[tokio::test]
    async fn empty_pipeline_is_healthy() {
        let store = InMemoryJobStore::arc();
        let report = monitor(&store).health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 4);

        let dashboard = monitor(&store).dashboard().await.unwrap();
        assert_eq!(dashboard.queue.backlog, 0);
        assert_eq!(dashboard.hourly.len(), 24);
        assert!(dashboard.recent_jobs.is_empty());
    }

    #[tokio::test]
    async fn metrics_reflect_finished_jobs() {
        let store = InMemoryJobStore::arc();
        run_job(&store, 8, 0).await;
        let partial = run_job(&store, 3, 1).await;

        let m = monitor(&store);
        let queue = m.queue_metrics().await.unwrap();
        assert_eq!(queue.jobs.completed, 1);
        assert_eq!(queue.jobs.partially_failed, 1);
        assert!(queue.tasks.is_none());

        let perf = m.performance_metrics().await.unwrap();
        assert_eq!(perf.jobs_finished, 2);
        assert_eq!(perf.items_processed, 12);

        let errors = m.error_metrics().await.unwrap();
        assert_eq!(errors.items_failed, 1);
        assert_eq!(errors.top_reasons[0].reason, "inference failed: 503");

        let dlq = m.dlq_metrics().await.unwrap();
        assert_eq!(dlq.total, 1);
        assert_eq!(dlq.by_reason.get("inference failed: 503"), Some(&1));

        let recent = m.recent_jobs(1).await.unwrap();
        assert_eq!(recent[0].id, partial.id);

        let hourly = m.hourly_stats().await.unwrap();
        assert_eq!(hourly.last().unwrap().jobs_completed, 2);
    }

    #[tokio::test]
    async fn top_reasons_cover_only_the_window() {
        let store = InMemoryJobStore::arc();
        let job = run_job(&store, 2, 1).await;
        let mut stale = DeadLetterEntry::for_item(&job, &CatalogItem::new("old"), "timeout", 3);
        stale.moved_at = Utc::now() - chrono::Duration::days(2);
        store.push(stale.clone()).await.unwrap();
        store.push(DeadLetterEntry { id: DeadLetterId::new(), ..stale }).await.unwrap();

        let m = monitor(&store);
        let errors = m.error_metrics().await.unwrap();
        let reasons: Vec<_> = errors.top_reasons.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons, ["inference failed: 503"]);

        let dlq = m.dlq_metrics().await.unwrap();
        assert_eq!(dlq.total, 3);
        assert_eq!(dlq.by_reason.get("timeout"), Some(&2));

        let dashboard = m.dashboard().await.unwrap();
        assert_eq!(dashboard.errors.top_reasons, errors.top_reasons);
        assert_eq!(dashboard.dead_letters.total, 3);
    }

    #[tokio::test]
    async fn high_failure_rate_is_unhealthy() {
        let store = InMemoryJobStore::arc();
        run_job(&store, 1, 3).await;

        let report = monitor(&store).health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let triggered: Vec<_> = report.triggered().map(|c| c.name.as_str()).collect();
        assert_eq!(triggered, vec!["failure_rate"]);
    }

    #[tokio::test]
    async fn store_outage_is_flagged_not_empty() {
        let store = InMemoryJobStore::arc();
        run_job(&store, 2, 0).await;
        store.set_available(false);

        let m = monitor(&store);
        assert!(matches!(m.queue_metrics().await, Err(MonitorError::StoreUnavailable(_))));
        assert!(matches!(m.recent_jobs(5).await, Err(MonitorError::StoreUnavailable(_))));
        assert!(matches!(m.dlq_metrics().await, Err(MonitorError::StoreUnavailable(_))));
        assert!(matches!(m.dashboard().await, Err(MonitorError::StoreUnavailable(_))));

        let report = m.health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks[0].name, "store");
    }

    #[tokio::test]
    async fn queue_metrics_include_tasks() {
        let store = InMemoryJobStore::arc();
        let tasks = TaskQueue::new(TaskQueueConfig::default());
        let id = tasks.enqueue(async { Ok::<_, String>(1) });

        while tasks.get(id).is_some_and(|t| !t.status.is_terminal()) {
            tokio::task::yield_now().await;
        }
        let queue = monitor(&store).with_task_queue(tasks).queue_metrics().await.unwrap();
        assert_eq!(queue.tasks.map(|t| t.completed), Some(1));
    }
}
