//! Job and dead-letter storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use opsflow_core::{DeadLetterId, JobId};

use super::types::{BatchOutcome, DeadLetterEntry, DeadLetterSummary, Job, JobStatus};

/// Persistence for batch jobs.
///
/// Counter updates and status transitions are atomic per job; readers get
/// snapshots and never wait on the job's background routine.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Compare-and-set `pending -> running`.
    ///
    /// Returns the started job, or `None` if it was not pending.
    async fn try_start(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Add a batch to the counters and bump the heartbeat.
    ///
    /// Returns `false` without writing if the job is no longer running.
    async fn record_batch(
        &self,
        job_id: JobId,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Compare-and-set `running -> paused`; `false` if it was not running.
    async fn pause(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Compare-and-set `paused -> running`, bumping the heartbeat.
    ///
    /// Returns the resumed job, or `None` if it was not paused.
    async fn resume(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Bump the heartbeat of a running job; `false` if it is not running.
    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Move a pending, running or paused job to a terminal status.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Running jobs whose last heartbeat (or start) is before `cutoff`.
    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Terminal jobs completed at or after `since`.
    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Dead-lettered items awaiting inspection or replay.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), JobStoreError>;

    /// Oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    async fn get_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    /// Take an entry out of the store, e.g. for replay.
    async fn remove_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    async fn summary(&self) -> Result<DeadLetterSummary, JobStoreError>;

    /// Summary of the entries moved at or after `since`.
    async fn summary_since(&self, since: DateTime<Utc>) -> Result<DeadLetterSummary, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl JobStoreError {
    /// Whether the failure is the store itself rather than the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, JobStoreError::Storage(_) | JobStoreError::Unavailable(_))
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub partially_failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Paused => self.paused,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::PartiallyFailed => self.partially_failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub(crate) fn slot(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::PartiallyFailed => &mut self.partially_failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }
}

/// In-memory job and dead-letter store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterEntry>>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), JobStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory store offline".into()))
        }
    }

    fn collect<F>(&self, mut keep: F) -> Vec<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs.values().filter(|j| keep(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check()?;
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn try_start(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.mark_running(now);
        Ok(Some(job.clone()))
    }

    async fn record_batch(
        &self,
        job_id: JobId,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.apply_batch(outcome, now);
        Ok(true)
    }

    async fn pause(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.mark_paused();
        Ok(true)
    }

    async fn resume(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Paused {
            return Ok(None);
        }
        job.mark_resumed(now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.heartbeat_at = Some(now);
        Ok(true)
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.check()?;
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status.is_terminal() || !status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id: job_id,
                from: job.status,
                to: status,
            });
        }
        job.mark_finished(status, error, now);
        Ok(job.clone())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.check()?;
        let mut result = self.collect(|_| true);
        result.reverse();
        result.truncate(limit);
        Ok(result)
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.check()?;
        let mut result = self.collect(|j| j.status == status);
        result.truncate(limit);
        Ok(result)
    }

    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.check()?;
        Ok(self.collect(|j| {
            j.status == JobStatus::Running && j.last_seen().is_none_or(|seen| seen < cutoff)
        }))
    }

    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.check()?;
        Ok(self.collect(|j| {
            j.status.is_terminal() && j.completed_at.is_some_and(|at| at >= since)
        }))
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.check()?;
        Ok(self.collect(|j| j.created_at >= since))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.check()?;
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryJobStore {
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), JobStoreError> {
        self.check()?;
        self.dead_letters.write().unwrap().insert(entry.id, entry);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.check()?;
        let dls = self.dead_letters.read().unwrap();
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| (e.moved_at, e.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.check()?;
        let dls = self.dead_letters.read().unwrap();
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job_id == Some(job_id))
            .cloned()
            .collect();
        result.sort_by_key(|e| (e.moved_at, e.id));
        Ok(result)
    }

    async fn get_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        self.check()?;
        Ok(self.dead_letters.read().unwrap().get(&id).cloned())
    }

    async fn remove_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        self.check()?;
        Ok(self.dead_letters.write().unwrap().remove(&id))
    }

    async fn summary(&self) -> Result<DeadLetterSummary, JobStoreError> {
        self.check()?;
        let dls = self.dead_letters.read().unwrap();
        Ok(summarize(dls.values()))
    }

    async fn summary_since(&self, since: DateTime<Utc>) -> Result<DeadLetterSummary, JobStoreError> {
        self.check()?;
        let dls = self.dead_letters.read().unwrap();
        Ok(summarize(dls.values().filter(|e| e.moved_at >= since)))
    }
}

fn summarize<'a>(entries: impl Iterator<Item = &'a DeadLetterEntry>) -> DeadLetterSummary {
    let mut summary = DeadLetterSummary::default();
    for entry in entries {
        summary.total += 1;
        *summary.by_reason.entry(entry.failure_reason.clone()).or_default() += 1;
        summary.oldest_moved_at = Some(match summary.oldest_moved_at {
            Some(oldest) => oldest.min(entry.moved_at),
            None => entry.moved_at,
        });
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{CatalogFilter, CategorizeConfig, ItemOutcome, JobSpec};
    use opsflow_ai::CatalogItem;

    fn job() -> Job {
        Job::new(
            JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default()),
            10,
            "tester",
        )
        .with_total_items(5)
    }

    fn batch(succeeded: u64, failed: u64) -> BatchOutcome {
        BatchOutcome {
            succeeded,
            failed,
            pending_review: 0,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(job.clone()).await.unwrap();
        assert_eq!(
            store.insert(job.clone()).await,
            Err(JobStoreError::AlreadyExists(job.id))
        );
    }

    #[tokio::test]
    async fn try_start_is_compare_and_set() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let now = Utc::now();
        let started = store.try_start(id, now).await.unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.started_at, Some(now));

        assert!(store.try_start(id, now).await.unwrap().is_none());
        assert!(matches!(
            store.try_start(JobId::new(), now).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn record_batch_only_while_running() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let now = Utc::now();
        assert!(!store.record_batch(id, &batch(1, 0), now).await.unwrap());

        store.try_start(id, now).await.unwrap();
        assert!(store.record_batch(id, &batch(1, 1), now).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(
            (job.processed_count, job.succeeded_count, job.failed_count),
            (2, 1, 1)
        );

        store.finish(id, JobStatus::PartiallyFailed, None, now).await.unwrap();
        assert!(!store.record_batch(id, &batch(1, 0), now).await.unwrap());
        assert!(!store.heartbeat(id, now).await.unwrap());
    }

    #[tokio::test]
    async fn finish_never_leaves_terminal_state() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let now = Utc::now();
        assert!(matches!(
            store.finish(id, JobStatus::Running, None, now).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));

        store.finish(id, JobStatus::Cancelled, None, now).await.unwrap();
        let err = store
            .finish(id, JobStatus::Failed, Some("late".into()), now)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                id,
                from: JobStatus::Cancelled,
                to: JobStatus::Failed,
            }
        );
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn pause_and_resume_are_compare_and_set() {
        let store = InMemoryJobStore::new();
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        assert!(!store.pause(id).await.unwrap());
        let t0 = Utc::now();
        store.try_start(id, t0).await.unwrap();
        store.record_batch(id, &batch(2, 0), t0).await.unwrap();

        assert!(store.pause(id).await.unwrap());
        assert!(!store.pause(id).await.unwrap());
        assert!(!store.record_batch(id, &batch(1, 0), t0).await.unwrap());
        assert_eq!(store.stats().await.unwrap().paused, 1);

        let t1 = t0 + chrono::Duration::seconds(5);
        let resumed = store.resume(id, t1).await.unwrap().unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(resumed.processed_count, 2);
        assert_eq!(resumed.started_at, Some(t0));
        assert_eq!(resumed.heartbeat_at, Some(t1));
        assert!(store.resume(id, t1).await.unwrap().is_none());

        store.pause(id).await.unwrap();
        store.finish(id, JobStatus::Cancelled, None, t1).await.unwrap();
        assert!(store.resume(id, t1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_running_uses_last_heartbeat() {
        let store = InMemoryJobStore::new();
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        let t0 = Utc::now() - chrono::Duration::minutes(30);
        store.try_start(a_id, t0).await.unwrap();
        store.try_start(b_id, t0).await.unwrap();
        store.heartbeat(b_id, Utc::now()).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(15);
        let stale = store.list_stale_running(cutoff).await.unwrap();
        assert_eq!(stale.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a_id]);
    }

    #[tokio::test]
    async fn listings_and_stats() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = job();
            ids.push(job.id);
            store.insert(job).await.unwrap();
        }
        store.try_start(ids[0], Utc::now()).await.unwrap();

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created_at >= recent[1].created_at);

        let pending = store.list_by_status(JobStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 3);
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let job = job();
        let item = CatalogItem::new("sku-3");

        let first = DeadLetterEntry::for_item(&job, &item, "inference failed", 3);
        let second = DeadLetterEntry::for_item(&job, &CatalogItem::new("sku-4"), "inference failed", 3);
        let other = DeadLetterEntry::for_item(&job, &CatalogItem::new("sku-5"), "invalid input", 1);
        store.push(first.clone()).await.unwrap();
        store.push(second).await.unwrap();
        store.push(other).await.unwrap();

        assert_eq!(store.list_for_job(job.id).await.unwrap().len(), 3);
        assert_eq!(store.list(2).await.unwrap().len(), 2);

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_reason["inference failed"], 2);
        assert_eq!(summary.oldest_moved_at, Some(first.moved_at));

        let mut old = DeadLetterEntry::for_item(&job, &CatalogItem::new("sku-0"), "timeout", 3);
        old.moved_at = Utc::now() - chrono::Duration::days(3);
        store.push(old).await.unwrap();
        let recent = store
            .summary_since(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(recent.total, 3);
        assert!(!recent.by_reason.contains_key("timeout"));
        assert_eq!(store.summary().await.unwrap().total, 4);

        let removed = store.remove_entry(first.id).await.unwrap().unwrap();
        assert_eq!(removed.item_id, "sku-3");
        assert!(store.get_entry(first.id).await.unwrap().is_none());
        assert!(store.remove_entry(first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryJobStore::new();
        store.set_available(false);
        assert!(matches!(store.stats().await, Err(JobStoreError::Unavailable(_))));
        assert!(store.summary().await.unwrap_err().is_infrastructure());

        store.set_available(true);
        assert!(store.stats().await.is_ok());
    }

    #[test]
    fn batch_outcome_accounting() {
        let mut outcome = BatchOutcome::default();
        outcome.record(ItemOutcome::Applied);
        outcome.record(ItemOutcome::NeedsReview);
        outcome.record(ItemOutcome::Failed);
        assert_eq!(outcome.processed(), 3);
        assert_eq!(outcome.pending_review, 1);
    }
}
