//! Shared fixtures for unit and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use opsflow_core::{DeadLetterId, JobId};

use opsflow_ai::{
    AiError, CatalogItem, Classification, ClassificationProvider, FnProvider, InferenceRequest,
};

use crate::jobs::{
    DeadLetterEntry, DeadLetterStore, DeadLetterSummary, InMemoryEntitySource, InMemoryJobStore,
    InMemoryResultSink, JobManager, JobManagerConfig, JobManagerDeps, JobStoreError, RetryPolicy,
};
use crate::rate_limit::RateLimiter;

/// `item-1` .. `item-n`, all from supplier `acme`.
pub fn catalog(n: usize) -> Vec<CatalogItem> {
    (1..=n)
        .map(|i| CatalogItem::new(format!("item-{i}")).with_supplier("acme"))
        .collect()
}

/// Manager config with instant retries.
pub fn fast_config() -> JobManagerConfig {
    JobManagerConfig::default()
        .with_item_retry(RetryPolicy::fixed(3, Duration::ZERO))
        .with_max_rate_limit_wait(Duration::from_millis(1))
}

/// Provider that blocks each call until a permit is released.
#[derive(Debug)]
pub struct GatedProvider {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ClassificationProvider for GatedProvider {
    fn name(&self) -> &str {
        "gated"
    }

    async fn classify(
        &self,
        _item: &CatalogItem,
        _request: &InferenceRequest,
    ) -> Result<Classification, AiError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AiError::Internal(e.to_string()))?;
        permit.forget();
        Ok(Classification::new("gated", 0.9))
    }
}

/// Dead-letter store whose next `failures` writes report the store offline.
#[derive(Debug)]
pub struct FlakyDeadLetters {
    pub inner: Arc<InMemoryJobStore>,
    failures: AtomicU32,
}

impl FlakyDeadLetters {
    pub fn new(inner: Arc<InMemoryJobStore>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    /// Every write fails.
    pub fn broken(inner: Arc<InMemoryJobStore>) -> Self {
        Self::new(inner, u32::MAX)
    }
}

#[async_trait]
impl DeadLetterStore for FlakyDeadLetters {
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), JobStoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(JobStoreError::Unavailable("dead-letter table locked".into()));
        }
        self.inner.push(entry).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.inner.list(limit).await
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.inner.list_for_job(job_id).await
    }

    async fn get_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        self.inner.get_entry(id).await
    }

    async fn remove_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        self.inner.remove_entry(id).await
    }

    async fn summary(&self) -> Result<DeadLetterSummary, JobStoreError> {
        self.inner.summary().await
    }

    async fn summary_since(&self, since: DateTime<Utc>) -> Result<DeadLetterSummary, JobStoreError> {
        self.inner.summary_since(since).await
    }
}

/// In-memory pipeline over a catalog of `n` items.
pub struct Harness {
    pub manager: JobManager,
    pub store: Arc<InMemoryJobStore>,
    pub source: Arc<InMemoryEntitySource>,
    pub sink: Arc<InMemoryResultSink>,
    pub limiter: Arc<RateLimiter>,
}

impl Harness {
    pub fn new<F>(n: usize, classify: F) -> Self
    where
        F: Fn(&CatalogItem, &InferenceRequest) -> Result<Classification, AiError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_limiter(n, RateLimiter::default(), classify)
    }

    pub fn with_limiter<F>(n: usize, limiter: RateLimiter, classify: F) -> Self
    where
        F: Fn(&CatalogItem, &InferenceRequest) -> Result<Classification, AiError>
            + Send
            + Sync
            + 'static,
    {
        let provider = Arc::new(FnProvider::new("test", classify));
        Self::build(n, limiter, provider, |store| {
            store as Arc<dyn DeadLetterStore>
        })
    }

    /// Dead letters go through `wrap(store)` instead of the job store.
    pub fn with_dead_letters<F, W>(n: usize, classify: F, wrap: W) -> Self
    where
        F: Fn(&CatalogItem, &InferenceRequest) -> Result<Classification, AiError>
            + Send
            + Sync
            + 'static,
        W: FnOnce(Arc<InMemoryJobStore>) -> Arc<dyn DeadLetterStore>,
    {
        let provider = Arc::new(FnProvider::new("test", classify));
        Self::build(n, RateLimiter::default(), provider, wrap)
    }

    pub fn gated(n: usize, gate: Arc<Semaphore>) -> Self {
        let provider = Arc::new(GatedProvider { gate });
        Self::build(n, RateLimiter::default(), provider, |store| {
            store as Arc<dyn DeadLetterStore>
        })
    }

    fn build<W>(
        n: usize,
        limiter: RateLimiter,
        provider: Arc<dyn ClassificationProvider>,
        dead_letters: W,
    ) -> Self
    where
        W: FnOnce(Arc<InMemoryJobStore>) -> Arc<dyn DeadLetterStore>,
    {
        let store = InMemoryJobStore::arc();
        let source = InMemoryEntitySource::arc(catalog(n));
        let sink = Arc::new(InMemoryResultSink::new());
        let limiter = Arc::new(limiter);
        let deps = JobManagerDeps {
            jobs: store.clone(),
            dead_letters: dead_letters(store.clone()),
            source: source.clone(),
            provider,
            sink: sink.clone(),
        };
        Self {
            manager: JobManager::new(fast_config(), limiter.clone(), deps),
            store,
            source,
            sink,
            limiter,
        }
    }
}
