//! Metric views computed from job and dead-letter snapshots.
//!
//! Everything here is a pure function of its inputs; [`super::PipelineMonitor`]
//! does the fetching.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use opsflow_core::JobId;

use crate::jobs::{DeadLetterSummary, Job, JobStats, JobStatus};
use crate::task_queue::TaskStats;

/// Backlog depth.
///
/// Paused jobs count as backlog: they still owe their remaining items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub jobs: JobStats,
    /// `pending + running + paused`
    pub backlog: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskStats>,
}

impl QueueMetrics {
    pub fn new(jobs: JobStats, tasks: Option<TaskStats>) -> Self {
        Self {
            backlog: jobs.pending + jobs.running + jobs.paused,
            jobs,
            tasks,
        }
    }
}

/// Throughput and latency over jobs that finished in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub window_secs: u64,
    pub jobs_finished: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub avg_duration_ms: Option<f64>,
    pub max_duration_ms: Option<i64>,
    /// Items per second of job runtime
    pub throughput_per_sec: Option<f64>,
    /// `items_succeeded / items_processed`
    pub success_rate: Option<f64>,
}

impl PerformanceMetrics {
    pub fn from_finished(jobs: &[Job], window_secs: u64) -> Self {
        let items_processed: u64 = jobs.iter().map(|j| j.processed_count).sum();
        let items_succeeded: u64 = jobs.iter().map(|j| j.succeeded_count).sum();

        let durations: Vec<i64> = jobs
            .iter()
            .filter_map(Job::duration)
            .map(|d| d.num_milliseconds().max(0))
            .collect();
        let total_ms: i64 = durations.iter().sum();

        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(total_ms as f64 / durations.len() as f64)
        };
        let throughput_per_sec = if total_ms > 0 {
            Some(items_processed as f64 / (total_ms as f64 / 1000.0))
        } else {
            None
        };

        Self {
            window_secs,
            jobs_finished: jobs.len() as u64,
            items_processed,
            items_succeeded,
            avg_duration_ms,
            max_duration_ms: durations.iter().copied().max(),
            throughput_per_sec,
            success_rate: ratio(items_succeeded, items_processed),
        }
    }
}

/// A dead-letter reason and how often it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

/// A finished job that carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub window_secs: u64,
    pub failed_jobs: u64,
    pub partially_failed_jobs: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub item_failure_rate: Option<f64>,
    /// Most frequent reasons among dead letters moved within the window,
    /// largest first
    pub top_reasons: Vec<ReasonCount>,
    /// Newest first
    pub recent_failures: Vec<JobFailure>,
}

impl ErrorMetrics {
    pub fn build(
        finished: &[Job],
        dead_letters: &DeadLetterSummary,
        window_secs: u64,
        max_entries: usize,
    ) -> Self {
        let count = |status| finished.iter().filter(|j| j.status == status).count() as u64;
        let items_processed: u64 = finished.iter().map(|j| j.processed_count).sum();
        let items_failed: u64 = finished.iter().map(|j| j.failed_count).sum();

        let mut recent_failures: Vec<JobFailure> = finished
            .iter()
            .filter_map(|j| {
                j.error_message.as_ref().map(|message| JobFailure {
                    job_id: j.id,
                    status: j.status,
                    message: message.clone(),
                    completed_at: j.completed_at,
                })
            })
            .collect();
        recent_failures.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        recent_failures.truncate(max_entries);

        Self {
            window_secs,
            failed_jobs: count(JobStatus::Failed),
            partially_failed_jobs: count(JobStatus::PartiallyFailed),
            items_processed,
            items_failed,
            item_failure_rate: ratio(items_failed, items_processed),
            top_reasons: top_reasons(&dead_letters.by_reason, max_entries),
            recent_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqMetrics {
    pub total: u64,
    pub oldest_moved_at: Option<DateTime<Utc>>,
    pub oldest_age_secs: Option<i64>,
    pub by_reason: BTreeMap<String, u64>,
}

impl DlqMetrics {
    pub fn from_summary(summary: DeadLetterSummary, now: DateTime<Utc>) -> Self {
        Self {
            total: summary.total,
            oldest_moved_at: summary.oldest_moved_at,
            oldest_age_secs: summary
                .oldest_moved_at
                .map(|at| (now - at).num_seconds().max(0)),
            by_reason: summary.by_reason,
        }
    }
}

/// One hour of activity. Finished-job counts land in the hour the job
/// completed, creations in the hour it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub items_processed: u64,
    pub items_failed: u64,
}

/// `hours` buckets ending with the one containing `now`, oldest first.
pub fn hourly_buckets(
    created: &[Job],
    finished: &[Job],
    now: DateTime<Utc>,
    hours: u32,
) -> Vec<HourlyBucket> {
    let current = hour_index(now);
    let first = current - i64::from(hours) + 1;

    let mut buckets: Vec<HourlyBucket> = (first..=current)
        .map(|h| HourlyBucket {
            hour_start: DateTime::from_timestamp(h * 3600, 0).unwrap_or_default(),
            jobs_created: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            items_processed: 0,
            items_failed: 0,
        })
        .collect();

    let slot = |at: DateTime<Utc>| {
        let h = hour_index(at);
        (first..=current).contains(&h).then(|| (h - first) as usize)
    };

    for job in created {
        if let Some(i) = slot(job.created_at) {
            buckets[i].jobs_created += 1;
        }
    }
    for job in finished {
        let Some(i) = job.completed_at.and_then(slot) else {
            continue;
        };
        let bucket = &mut buckets[i];
        match job.status {
            JobStatus::Completed | JobStatus::PartiallyFailed => bucket.jobs_completed += 1,
            JobStatus::Failed => bucket.jobs_failed += 1,
            _ => {}
        }
        bucket.items_processed += job.processed_count;
        bucket.items_failed += job.failed_count;
    }
    buckets
}

fn hour_index(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

fn top_reasons(by_reason: &BTreeMap<String, u64>, limit: usize) -> Vec<ReasonCount> {
    let mut reasons: Vec<ReasonCount> = by_reason
        .iter()
        .map(|(reason, count)| ReasonCount {
            reason: reason.clone(),
            count: *count,
        })
        .collect();
    reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    reasons.truncate(limit);
    reasons
}

pub(crate) fn ratio(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BatchOutcome, CatalogFilter, CategorizeConfig, JobSpec};
    use chrono::{Duration, TimeZone};

    fn finished(status: JobStatus, ok: u64, failed: u64, started: DateTime<Utc>, secs: i64) -> Job {
        let mut job = Job::new(
            JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default()),
            10,
            "tester",
        )
        .with_total_items(ok + failed);
        job.created_at = started;
        job.mark_running(started);
        job.apply_batch(
            &BatchOutcome {
                succeeded: ok,
                failed,
                pending_review: 0,
            },
            started,
        );
        let error = (status == JobStatus::Failed).then(|| "source unreachable".to_string());
        job.mark_finished(status, error, started + Duration::seconds(secs));
        job
    }

    #[test]
    fn performance_aggregates_durations() {
        let t = Utc::now();
        let jobs = vec![
            finished(JobStatus::Completed, 10, 0, t, 2),
            finished(JobStatus::PartiallyFailed, 6, 2, t, 6),
        ];
        let perf = PerformanceMetrics::from_finished(&jobs, 3600);
        assert_eq!(perf.jobs_finished, 2);
        assert_eq!(perf.items_processed, 18);
        assert_eq!(perf.avg_duration_ms, Some(4000.0));
        assert_eq!(perf.max_duration_ms, Some(6000));
        assert_eq!(perf.throughput_per_sec, Some(18.0 / 8.0));
        assert_eq!(perf.success_rate, Some(16.0 / 18.0));
    }

    #[test]
    fn empty_window_has_no_rates() {
        let perf = PerformanceMetrics::from_finished(&[], 3600);
        assert_eq!(perf.avg_duration_ms, None);
        assert_eq!(perf.throughput_per_sec, None);
        assert_eq!(perf.success_rate, None);
    }

    #[test]
    fn errors_rank_reasons_and_list_failures() {
        let t = Utc::now();
        let jobs = vec![
            finished(JobStatus::Failed, 0, 0, t, 1),
            finished(JobStatus::PartiallyFailed, 3, 1, t, 1),
        ];
        let summary = DeadLetterSummary {
            total: 4,
            oldest_moved_at: Some(t),
            by_reason: BTreeMap::from([("timeout".to_string(), 1), ("rate limited".to_string(), 3)]),
        };
        let errors = ErrorMetrics::build(&jobs, &summary, 3600, 10);
        assert_eq!((errors.failed_jobs, errors.partially_failed_jobs), (1, 1));
        assert_eq!(errors.item_failure_rate, Some(0.25));
        assert_eq!(errors.top_reasons[0].reason, "rate limited");
        assert_eq!(errors.recent_failures.len(), 1);
        assert_eq!(errors.recent_failures[0].message, "source unreachable");
    }

    #[test]
    fn buckets_cover_trailing_hours() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let jobs = vec![
            finished(JobStatus::Completed, 5, 0, now - Duration::minutes(1), 0),
            finished(JobStatus::Failed, 0, 0, now - Duration::hours(3), 10),
            finished(JobStatus::Completed, 1, 0, now - Duration::hours(30), 1),
        ];
        let buckets = hourly_buckets(&jobs, &jobs, now, 24);

        assert_eq!(buckets.len(), 24);
        assert!(buckets.windows(2).all(|w| w[0].hour_start < w[1].hour_start));
        let last = buckets.last().unwrap();
        assert_eq!(last.jobs_created, 1);
        assert_eq!(last.items_processed, 5);
        assert_eq!(buckets.iter().map(|b| b.jobs_failed).sum::<u64>(), 1);
        assert_eq!(buckets.iter().map(|b| b.jobs_created).sum::<u64>(), 2);
    }
}
