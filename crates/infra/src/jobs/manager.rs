//! Batch job lifecycle: create, run, pause, cancel, inspect, replay.
//!
//! ## State machine
//!
//! ```text
//! pending --process_job--> running --all items--> completed | partially_failed
//!    |                      |  ^  |--iteration / dead-letter write failed, reaped--> failed
//!    |          pause_job   |  |  resume_job
//!    |     (batch boundary) v  |
//!    |                     paused
//!    '--cancel_job------------'--cancel (batch boundary)--> cancelled
//! ```
//!
//! Terminal states are final. Item failures never abort a job; they are
//! counted and dead-lettered. Failing to iterate the job's items, or to
//! persist a dead letter, is job-fatal: an item is never counted as failed
//! without an entry to inspect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use opsflow_ai::{CatalogItem, ClassificationProvider, InferenceRequest};
use opsflow_core::{DeadLetterId, DomainError, JobId, TenantId};

use crate::rate_limit::{Admission, CallerContext, Identity, RateLimiter};

use super::sink::ResultSink;
use super::source::{EntitySource, SourceError};
use super::store::{DeadLetterStore, JobStore, JobStoreError};
use super::types::{
    BatchOutcome, DeadLetterEntry, ItemOutcome, Job, JobProgress, JobSpec, JobStatus, JobType,
    RetryPolicy,
};

/// Dead letters listed in [`JobProgress::recent_errors`].
const RECENT_ERRORS: usize = 5;

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobManagerConfig {
    /// Used when a request does not name a batch size
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Per-item attempts and backoff; also applied to page fetches
    pub item_retry: RetryPolicy,
    /// Upper bound on a single wait after a rate-limit denial
    pub max_rate_limit_wait: Duration,
    /// Minimum spacing of mid-batch heartbeats
    pub heartbeat_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 50,
            max_batch_size: 200,
            batch_delay: Duration::ZERO,
            item_retry: RetryPolicy::default(),
            max_rate_limit_wait: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl JobManagerConfig {
    pub fn with_batch_sizes(mut self, default: u32, max: u32) -> Self {
        self.default_batch_size = default;
        self.max_batch_size = max;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_item_retry(mut self, policy: RetryPolicy) -> Self {
        self.item_retry = policy;
        self
    }

    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// A request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub spec: JobSpec,
    /// Signed; values outside `1..=max_batch_size` are rejected.
    pub batch_size: Option<i64>,
    pub created_by: String,
    pub tenant_id: Option<TenantId>,
}

impl NewJob {
    pub fn new(spec: JobSpec, created_by: impl Into<String>) -> Self {
        Self {
            spec,
            batch_size: None,
            created_by: created_by.into(),
            tenant_id: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Collaborators a [`JobManager`] runs against.
#[derive(Clone)]
pub struct JobManagerDeps {
    pub jobs: Arc<dyn JobStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub source: Arc<dyn EntitySource>,
    pub provider: Arc<dyn ClassificationProvider>,
    pub sink: Arc<dyn ResultSink>,
}

impl std::fmt::Debug for JobManagerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManagerDeps")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

/// Stop signals for one in-process run.
#[derive(Debug, Clone)]
struct RunControl {
    cancel: CancellationToken,
    pause: CancellationToken,
}

struct ManagerInner {
    config: JobManagerConfig,
    deps: JobManagerDeps,
    limiter: Arc<RateLimiter>,
    root: CancellationToken,
    running: Mutex<HashMap<JobId, RunControl>>,
}

/// Owns batch jobs from creation to terminal status. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("running", &self.running_jobs().len())
            .finish()
    }
}

/// Unregisters a job's run controls when its run ends, however it ends.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<JobId, RunControl>>,
    job_id: JobId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().unwrap().remove(&self.job_id);
    }
}

impl JobManager {
    pub fn new(config: JobManagerConfig, limiter: Arc<RateLimiter>, deps: JobManagerDeps) -> Self {
        Self::with_parent_token(config, limiter, deps, &CancellationToken::new())
    }

    /// Cancelling `parent` cancels every job this manager is running.
    pub fn with_parent_token(
        config: JobManagerConfig,
        limiter: Arc<RateLimiter>,
        deps: JobManagerDeps,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                deps,
                limiter,
                root: parent.child_token(),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    /// Ids of jobs currently executing in this process.
    pub fn running_jobs(&self) -> Vec<JobId> {
        self.inner.running.lock().unwrap().keys().copied().collect()
    }

    fn resolve_batch_size(&self, requested: Option<i64>) -> Result<u32, DomainError> {
        let max = self.inner.config.max_batch_size;
        match requested {
            None => Ok(self.inner.config.default_batch_size.clamp(1, max.max(1))),
            Some(n) if n >= 1 && n <= i64::from(max) => Ok(n as u32),
            Some(n) => Err(DomainError::validation(format!(
                "batch_size must be between 1 and {max}, got {n}"
            ))),
        }
    }

    /// Validate, count the items in scope and persist a pending job.
    pub async fn create_job(&self, request: NewJob) -> Result<JobId, JobError> {
        let batch_size = self.resolve_batch_size(request.batch_size)?;
        request.spec.validate()?;

        let mut total = self
            .inner
            .deps
            .source
            .count(request.tenant_id, &request.spec.scope())
            .await?;
        if let JobSpec::FullScan { filter, .. } = &request.spec {
            if let Some(limit) = filter.limit {
                total = total.min(limit);
            }
        }

        let mut job = Job::new(request.spec, batch_size, request.created_by).with_total_items(total);
        job.tenant_id = request.tenant_id;
        let job_id = job.id;
        let job_type = job.job_type();
        self.inner.deps.jobs.insert(job).await?;

        info!(job_id = %job_id, job_type = %job_type, total_items = total, batch_size, "job created");
        Ok(job_id)
    }

    /// Create a job and run it in the background.
    pub async fn submit(&self, request: NewJob) -> Result<JobId, JobError> {
        let job_id = self.create_job(request).await?;
        drop(self.spawn_job(job_id));
        Ok(job_id)
    }

    /// Run [`JobManager::process_job`] on the tokio runtime.
    pub fn spawn_job(&self, job_id: JobId) -> JoinHandle<Result<Job, JobError>> {
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.process_job(job_id).await;
            if let Err(e) = &result {
                error!(job_id = %job_id, error = %e, "background job ended with error");
            }
            result
        })
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.inner.deps.jobs.get(job_id).await?)
    }

    /// Claim `job_id` for a run in this process; `None` if it already has one.
    fn register(&self, job_id: JobId) -> Option<(RunControl, RunningGuard<'_>)> {
        let control = RunControl {
            cancel: self.inner.root.child_token(),
            pause: CancellationToken::new(),
        };
        let mut running = self.inner.running.lock().unwrap();
        if running.contains_key(&job_id) {
            return None;
        }
        running.insert(job_id, control.clone());
        let guard = RunningGuard {
            running: &self.inner.running,
            job_id,
        };
        Some((control, guard))
    }

    /// Run a pending job to a terminal status, or until it is paused.
    ///
    /// On any other status this is a no-op that returns the current job.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn process_job(&self, job_id: JobId) -> Result<Job, JobError> {
        let Some((control, _guard)) = self.register(job_id) else {
            debug!("job already has a run in this process");
            return self.current(job_id).await;
        };
        let current = self.current(job_id).await?;
        if current.status != JobStatus::Pending {
            debug!(status = %current.status, "job not pending; nothing to do");
            return Ok(current);
        }

        let Some(job) = self.inner.deps.jobs.try_start(job_id, Utc::now()).await? else {
            debug!("job was claimed or cancelled first");
            return self.current(job_id).await;
        };
        info!(job_type = %job.job_type(), total_items = job.total_items, "job started");

        self.run(job, control).await
    }

    /// Continue a paused job from its recorded counters.
    ///
    /// Runs like [`JobManager::process_job`]; spawn it to resume in the
    /// background. On any status but `paused` this is a no-op.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn resume_job(&self, job_id: JobId) -> Result<Job, JobError> {
        let Some((control, _guard)) = self.register(job_id) else {
            debug!("job already has a run in this process");
            return self.current(job_id).await;
        };
        let current = self.current(job_id).await?;
        if current.status != JobStatus::Paused {
            debug!(status = %current.status, "job not paused; nothing to resume");
            return Ok(current);
        }

        let Some(job) = self.inner.deps.jobs.resume(job_id, Utc::now()).await? else {
            debug!("job was resumed or cancelled first");
            return self.current(job_id).await;
        };
        info!(processed = job.processed_count, total_items = job.total_items, "job resumed");

        self.run(job, control).await
    }

    /// Request a pause.
    ///
    /// The run stops at its next batch boundary with its counters kept; a job
    /// on its last batch may complete instead. Returns `false` unless the job
    /// is running.
    pub async fn pause_job(&self, job_id: JobId) -> Result<bool, JobError> {
        let job = self.current(job_id).await?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }

        let control = self.inner.running.lock().unwrap().get(&job_id).cloned();
        if let Some(control) = control {
            control.pause.cancel();
            info!(job_id = %job_id, "pause requested");
            return Ok(true);
        }

        // Running somewhere else: its runner sees the job leave `running` at
        // its next write, and that batch is redone on resume.
        let paused = self.inner.deps.jobs.pause(job_id).await?;
        if paused {
            info!(job_id = %job_id, "job paused through store");
        }
        Ok(paused)
    }

    /// The job with derived progress and its latest dead letters.
    pub async fn job_progress(&self, job_id: JobId) -> Result<Option<JobProgress>, JobError> {
        let Some(job) = self.inner.deps.jobs.get(job_id).await? else {
            return Ok(None);
        };
        let recent_errors = self
            .inner
            .deps
            .dead_letters
            .list_for_job(job_id)
            .await?
            .into_iter()
            .rev()
            .take(RECENT_ERRORS)
            .map(|e| format!("{}: {}", e.item_id, e.failure_reason))
            .collect();
        Ok(Some(JobProgress::new(job, recent_errors, Utc::now())))
    }

    async fn current(&self, job_id: JobId) -> Result<Job, JobError> {
        self.inner
            .deps
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))
    }

    async fn run(&self, job: Job, control: RunControl) -> Result<Job, JobError> {
        let jobs = &self.inner.deps.jobs;
        let config = &self.inner.config;
        let identity = job_identity(&job);
        let batch_size = u64::from(job.batch_size.max(1));

        let mut offset = job.processed_count;
        let mut processed = job.processed_count;
        let mut failed = job.failed_count;
        let mut stopped = None;
        let mut last_beat = Instant::now();

        loop {
            let remaining = job.total_items.saturating_sub(processed);
            if remaining == 0 {
                break;
            }
            if control.cancel.is_cancelled() {
                stopped = Some(JobStatus::Cancelled);
                break;
            }
            if control.pause.is_cancelled() {
                stopped = Some(JobStatus::Paused);
                break;
            }

            let limit = batch_size.min(remaining) as usize;
            let page = match self.fetch_page(&job, offset, limit).await {
                Ok(page) => page,
                Err(e) => {
                    let reason = if processed == 0 {
                        format!("failed to open item iteration: {e}")
                    } else {
                        format!("failed to fetch page at offset {offset}: {e}")
                    };
                    error!(job_id = %job.id, error = %e, offset, "job iteration failed");
                    return self.finish(job.id, JobStatus::Failed, Some(reason)).await;
                }
            };
            if page.is_empty() {
                debug!(job_id = %job.id, offset, "source exhausted before total_items");
                break;
            }

            let mut outcome = BatchOutcome::default();
            let mut handled = 0u64;
            for item in page.iter().take(limit) {
                match self.process_item(&job, &identity, item).await {
                    Ok(item_outcome) => outcome.record(item_outcome),
                    Err(e) => {
                        error!(
                            job_id = %job.id,
                            item_id = %item.id,
                            error = %e,
                            "dead letter not persisted; failing job"
                        );
                        if !outcome.is_empty()
                            && !jobs.record_batch(job.id, &outcome, Utc::now()).await?
                        {
                            return self.current(job.id).await;
                        }
                        let reason =
                            format!("failed to persist dead letter for item {}: {e}", item.id);
                        return self.finish(job.id, JobStatus::Failed, Some(reason)).await;
                    }
                }
                handled += 1;

                if last_beat.elapsed() >= config.heartbeat_interval {
                    last_beat = Instant::now();
                    if !jobs.heartbeat(job.id, Utc::now()).await? {
                        warn!(job_id = %job.id, "job left running state mid-batch; stopping");
                        return self.current(job.id).await;
                    }
                }
            }

            offset += handled;
            processed += outcome.processed();
            failed += outcome.failed;

            if !jobs.record_batch(job.id, &outcome, Utc::now()).await? {
                warn!(job_id = %job.id, "job left running state; batch not recorded");
                return self.current(job.id).await;
            }
            last_beat = Instant::now();
            info!(
                job_id = %job.id,
                processed,
                total = job.total_items,
                batch_succeeded = outcome.succeeded,
                batch_failed = outcome.failed,
                "batch recorded"
            );

            if !config.batch_delay.is_zero() && processed < job.total_items {
                tokio::select! {
                    _ = control.cancel.cancelled() => {}
                    _ = control.pause.cancelled() => {}
                    _ = tokio::time::sleep(config.batch_delay) => {}
                }
            }
        }

        match stopped {
            Some(JobStatus::Paused) => self.park(job.id).await,
            Some(status) => self.finish(job.id, status, None).await,
            None if failed == 0 => self.finish(job.id, JobStatus::Completed, None).await,
            None => self.finish(job.id, JobStatus::PartiallyFailed, None).await,
        }
    }

    async fn park(&self, job_id: JobId) -> Result<Job, JobError> {
        if !self.inner.deps.jobs.pause(job_id).await? {
            warn!(job_id = %job_id, "job left running state before it could pause");
            return self.current(job_id).await;
        }
        let job = self.current(job_id).await?;
        info!(
            job_id = %job_id,
            processed = job.processed_count,
            total = job.total_items,
            "job paused"
        );
        Ok(job)
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        match self
            .inner
            .deps
            .jobs
            .finish(job_id, status, error, Utc::now())
            .await
        {
            Ok(job) => {
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    processed = job.processed_count,
                    succeeded = job.succeeded_count,
                    failed = job.failed_count,
                    pending_review = job.pending_review_count,
                    "job finished"
                );
                Ok(job)
            }
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                warn!(job_id = %job_id, status = %from, "job already terminal");
                self.current(job_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_page(
        &self,
        job: &Job,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        let policy = &self.inner.config.item_retry;
        let scope = job.spec.scope();
        let mut attempt = 1;
        loop {
            match self
                .inner
                .deps
                .source
                .page(job.tenant_id, &scope, offset, limit)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e @ SourceError::Unavailable(_)) if policy.should_retry(attempt) => {
                    warn!(job_id = %job.id, attempt, error = %e, "page fetch failed; retrying");
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Classify and apply one item, dead-lettering it once attempts run out.
    ///
    /// Errors only when the dead letter cannot be persisted.
    async fn process_item(
        &self,
        job: &Job,
        identity: &Identity,
        item: &CatalogItem,
    ) -> Result<ItemOutcome, JobStoreError> {
        let deps = &self.inner.deps;
        let config = &self.inner.config;
        let policy = &config.item_retry;
        let max_attempts = policy.max_attempts.max(1);
        let preset = job.spec.preset();
        let threshold = job.spec.confidence_threshold();

        let mut attempt = 0;
        let mut last_error = String::new();
        while attempt < max_attempts {
            attempt += 1;

            if let Admission::Denied { retry_after } = self.inner.limiter.admit(identity, preset) {
                last_error = format!("rate limited ({preset}), retry after {retry_after:?}");
                debug!(job_id = %job.id, item_id = %item.id, attempt, ?retry_after, "item rate limited");
                if attempt < max_attempts {
                    tokio::time::sleep(retry_after.min(config.max_rate_limit_wait)).await;
                }
                continue;
            }

            let request = InferenceRequest::new(job.spec.inference_task())
                .for_tenant(job.tenant_id)
                .with_model(job.spec.model().map(str::to_string))
                .attempt(attempt);

            match deps.provider.classify(item, &request).await {
                Ok(c) if job.spec.force_override() || c.meets(threshold) => {
                    match deps.sink.apply(job, item, &c).await {
                        Ok(()) => return Ok(ItemOutcome::Applied),
                        Err(e) => {
                            warn!(job_id = %job.id, item_id = %item.id, attempt, error = %e, "apply failed");
                            last_error = e.to_string();
                        }
                    }
                }
                Ok(c) => {
                    debug!(
                        job_id = %job.id,
                        item_id = %item.id,
                        confidence = c.confidence,
                        threshold,
                        "below threshold; left for review"
                    );
                    return Ok(ItemOutcome::NeedsReview);
                }
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %job.id, item_id = %item.id, attempt, error = %e, "inference failed");
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!(job_id = %job.id, item_id = %item.id, error = %e, "inference rejected item");
                    last_error = e.to_string();
                    break;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }

        let entry = DeadLetterEntry::for_item(job, item, last_error, attempt);
        warn!(
            job_id = %job.id,
            item_id = %item.id,
            attempts = attempt,
            reason = %entry.failure_reason,
            "item dead-lettered"
        );
        self.push_dead_letter(entry).await?;
        Ok(ItemOutcome::Failed)
    }

    /// Write with the item retry budget. Entry ids make retried writes idempotent.
    async fn push_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), JobStoreError> {
        let policy = &self.inner.config.item_retry;
        let mut attempt = 1;
        loop {
            match self.inner.deps.dead_letters.push(entry.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_infrastructure() && policy.should_retry(attempt) => {
                    warn!(
                        item_id = %entry.item_id,
                        attempt,
                        error = %e,
                        "dead letter write failed; retrying"
                    );
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Request cancellation.
    ///
    /// Pending and paused jobs are cancelled at once; running jobs stop at
    /// the next batch boundary. Returns `false` for terminal jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, JobError> {
        let job = self.current(job_id).await?;
        let jobs = &self.inner.deps.jobs;

        if matches!(job.status, JobStatus::Pending | JobStatus::Paused) {
            match jobs.finish(job_id, JobStatus::Cancelled, None, Utc::now()).await {
                Ok(_) => {
                    info!(job_id = %job_id, status = %job.status, "idle job cancelled");
                    return Ok(true);
                }
                Err(JobStoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let control = self.inner.running.lock().unwrap().get(&job_id).cloned();
        if let Some(control) = control {
            control.cancel.cancel();
            info!(job_id = %job_id, "cancellation requested");
            return Ok(true);
        }

        // Running somewhere else: stop it through the store. Its runner sees
        // the job leave `running` at its next write.
        match jobs.finish(job_id, JobStatus::Cancelled, None, Utc::now()).await {
            Ok(_) => {
                info!(job_id = %job_id, "job cancelled through store");
                Ok(true)
            }
            Err(JobStoreError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Items that permanently failed in `job_id`.
    pub async fn dead_letters(&self, job_id: JobId) -> Result<Vec<DeadLetterEntry>, JobError> {
        Ok(self.inner.deps.dead_letters.list_for_job(job_id).await?)
    }

    /// Turn a dead-lettered categorisation item into a new targeted job.
    ///
    /// The entry is removed once the job exists. The job is created pending;
    /// run it with [`JobManager::spawn_job`].
    pub async fn replay_dead_letter(&self, entry_id: DeadLetterId) -> Result<JobId, JobError> {
        let deps = &self.inner.deps;
        let entry = deps
            .dead_letters
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("dead letter {entry_id}")))?;

        if !matches!(
            entry.job_type,
            Some(JobType::FullScan | JobType::TargetedRecategorize)
        ) {
            return Err(DomainError::validation(format!(
                "dead letter {entry_id} is not from a categorisation job"
            ))
            .into());
        }

        let original = match entry.job_id {
            Some(id) => deps.jobs.get(id).await?,
            None => None,
        };
        let config = original
            .as_ref()
            .and_then(|j| j.spec.categorize_config().cloned())
            .unwrap_or_default();
        let created_by = original
            .as_ref()
            .map(|j| j.created_by.clone())
            .unwrap_or_else(|| "dead-letter-replay".to_string());

        let mut request = NewJob::new(JobSpec::recategorize([entry.item_id.clone()], config), created_by)
            .with_batch_size(1);
        request.tenant_id = entry.tenant_id;

        let job_id = self.create_job(request).await?;
        deps.dead_letters.remove_entry(entry_id).await?;
        info!(dead_letter_id = %entry_id, job_id = %job_id, item_id = %entry.item_id, "dead letter replayed");
        Ok(job_id)
    }
}

/// Rate-limit identity of a job: tenant, then creator, then `unknown`.
pub fn job_identity(job: &Job) -> Identity {
    CallerContext {
        tenant: job.tenant_id.map(|t| t.to_string()),
        user: Some(job.created_by.clone()),
        address: None,
    }
    .identity()
}
