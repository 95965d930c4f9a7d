//! Core job types and policies.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use opsflow_ai::{CatalogItem, InferenceTask};
use opsflow_core::{DeadLetterId, DomainError, DomainResult, JobId, TenantId};

use crate::rate_limit::RatePreset;

/// Default confidence a classification needs before it is applied.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Discriminant of [`JobSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullScan,
    TargetedRecategorize,
    PriceListExtraction,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullScan => "full_scan",
            JobType::TargetedRecategorize => "targeted_recategorize",
            JobType::PriceListExtraction => "price_list_extraction",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_scan" => Ok(JobType::FullScan),
            "targeted_recategorize" => Ok(JobType::TargetedRecategorize),
            "price_list_extraction" => Ok(JobType::PriceListExtraction),
            other => Err(DomainError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Which catalog items a full scan covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogFilter {
    pub supplier_id: Option<String>,
    /// Item statuses to include; empty means any.
    pub statuses: Vec<String>,
    /// Skip items that already carry a category.
    pub exclude_categorized: bool,
    pub confidence_min: Option<f64>,
    pub confidence_max: Option<f64>,
    /// Upper bound on the number of items in scope.
    pub limit: Option<u64>,
}

impl CatalogFilter {
    pub fn for_supplier(mut self, supplier_id: impl Into<String>) -> Self {
        self.supplier_id = Some(supplier_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.statuses.push(status.into());
        self
    }

    pub fn uncategorized_only(mut self) -> Self {
        self.exclude_categorized = true;
        self
    }

    pub fn with_confidence_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.confidence_min = min;
        self.confidence_max = max;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `item` is in scope.
    pub fn matches(&self, item: &CatalogItem) -> bool {
        if let Some(supplier) = &self.supplier_id {
            if item.supplier_id.as_ref() != Some(supplier) {
                return false;
            }
        }
        if !self.statuses.is_empty()
            && !self
                .statuses
                .iter()
                .any(|s| item.status.as_deref() == Some(s.as_str()))
        {
            return false;
        }
        if self.exclude_categorized && item.is_categorized() {
            return false;
        }
        if self.confidence_min.is_some() || self.confidence_max.is_some() {
            let Some(c) = item.confidence else {
                return false;
            };
            if self.confidence_min.is_some_and(|min| c < min) {
                return false;
            }
            if self.confidence_max.is_some_and(|max| c > max) {
                return false;
            }
        }
        true
    }

    fn validate(&self) -> DomainResult<()> {
        validate_unit("confidence_min", self.confidence_min)?;
        validate_unit("confidence_max", self.confidence_max)?;
        if let (Some(min), Some(max)) = (self.confidence_min, self.confidence_max) {
            if min > max {
                return Err(DomainError::validation(
                    "confidence_min must not exceed confidence_max",
                ));
            }
        }
        if self.limit == Some(0) {
            return Err(DomainError::validation("limit must be positive"));
        }
        Ok(())
    }
}

/// Parameters for categorisation jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizeConfig {
    pub confidence_threshold: f64,
    /// Apply every result regardless of confidence.
    pub force_override: bool,
    pub model: Option<String>,
}

impl Default for CategorizeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            force_override: false,
            model: None,
        }
    }
}

impl CategorizeConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_override = true;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Parameters for price-list extraction jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub confidence_threshold: f64,
    pub force_override: bool,
    pub default_currency: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            force_override: false,
            default_currency: None,
        }
    }
}

/// What a job does, with only the fields its type supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobSpec {
    FullScan {
        #[serde(default)]
        filter: CatalogFilter,
        #[serde(default)]
        config: CategorizeConfig,
    },
    TargetedRecategorize {
        item_ids: Vec<String>,
        #[serde(default)]
        config: CategorizeConfig,
    },
    PriceListExtraction {
        upload_id: String,
        #[serde(default)]
        config: ExtractionConfig,
    },
}

/// Items a job iterates, as handed to the entity source.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemScope<'a> {
    Filter(&'a CatalogFilter),
    Items(&'a [String]),
    Upload(&'a str),
}

impl JobSpec {
    pub fn full_scan(filter: CatalogFilter, config: CategorizeConfig) -> Self {
        Self::FullScan { filter, config }
    }

    pub fn recategorize<I, S>(item_ids: I, config: CategorizeConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TargetedRecategorize {
            item_ids: item_ids.into_iter().map(Into::into).collect(),
            config,
        }
    }

    pub fn price_list(upload_id: impl Into<String>, config: ExtractionConfig) -> Self {
        Self::PriceListExtraction {
            upload_id: upload_id.into(),
            config,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::FullScan { .. } => JobType::FullScan,
            JobSpec::TargetedRecategorize { .. } => JobType::TargetedRecategorize,
            JobSpec::PriceListExtraction { .. } => JobType::PriceListExtraction,
        }
    }

    pub fn scope(&self) -> ItemScope<'_> {
        match self {
            JobSpec::FullScan { filter, .. } => ItemScope::Filter(filter),
            JobSpec::TargetedRecategorize { item_ids, .. } => ItemScope::Items(item_ids),
            JobSpec::PriceListExtraction { upload_id, .. } => ItemScope::Upload(upload_id),
        }
    }

    /// Rate-limit preset consumed before each external call.
    pub fn preset(&self) -> RatePreset {
        match self {
            JobSpec::FullScan { .. } | JobSpec::TargetedRecategorize { .. } => {
                RatePreset::Classify
            }
            JobSpec::PriceListExtraction { .. } => RatePreset::Extract,
        }
    }

    pub fn inference_task(&self) -> InferenceTask {
        match self {
            JobSpec::PriceListExtraction { .. } => InferenceTask::ExtractPricing,
            _ => InferenceTask::Categorize,
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        match self {
            JobSpec::FullScan { config, .. } | JobSpec::TargetedRecategorize { config, .. } => {
                config.confidence_threshold
            }
            JobSpec::PriceListExtraction { config, .. } => config.confidence_threshold,
        }
    }

    pub fn force_override(&self) -> bool {
        match self {
            JobSpec::FullScan { config, .. } | JobSpec::TargetedRecategorize { config, .. } => {
                config.force_override
            }
            JobSpec::PriceListExtraction { config, .. } => config.force_override,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            JobSpec::FullScan { config, .. } | JobSpec::TargetedRecategorize { config, .. } => {
                config.model.as_deref()
            }
            JobSpec::PriceListExtraction { .. } => None,
        }
    }

    /// Categorisation config, if this is a categorisation job.
    pub fn categorize_config(&self) -> Option<&CategorizeConfig> {
        match self {
            JobSpec::FullScan { config, .. } | JobSpec::TargetedRecategorize { config, .. } => {
                Some(config)
            }
            JobSpec::PriceListExtraction { .. } => None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        validate_unit("confidence_threshold", Some(self.confidence_threshold()))?;
        match self {
            JobSpec::FullScan { filter, .. } => filter.validate(),
            JobSpec::TargetedRecategorize { item_ids, .. } => {
                if item_ids.is_empty() {
                    return Err(DomainError::validation("item_ids must not be empty"));
                }
                if item_ids.iter().any(|id| id.trim().is_empty()) {
                    return Err(DomainError::validation("item_ids must not contain blanks"));
                }
                Ok(())
            }
            JobSpec::PriceListExtraction { upload_id, .. } => {
                if upload_id.trim().is_empty() {
                    return Err(DomainError::validation("upload_id must not be empty"));
                }
                Ok(())
            }
        }
    }
}

fn validate_unit(field: &str, value: Option<f64>) -> DomainResult<()> {
    match value {
        Some(v) if !v.is_finite() || !(0.0..=1.0).contains(&v) => Err(DomainError::validation(
            format!("{field} must be within [0, 1], got {v}"),
        )),
        _ => Ok(()),
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for `process_job`
    Pending,
    /// Bound to its background routine
    Running,
    /// Stopped at a batch boundary on request; resumes from its counters
    Paused,
    /// Every item succeeded
    Completed,
    /// Could not iterate its items, or was reaped
    Failed,
    /// Ran to the end with at least one failed item
    PartiallyFailed,
    /// Stopped at a batch boundary on request
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::PartiallyFailed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PartiallyFailed => "partially_failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Per-item retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Counter deltas from one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: u64,
    pub failed: u64,
    /// Subset of `succeeded` held back for manual review.
    pub pending_review: u64,
}

impl BatchOutcome {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.processed() == 0
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Applied => self.succeeded += 1,
            ItemOutcome::NeedsReview => {
                self.succeeded += 1;
                self.pending_review += 1;
            }
            ItemOutcome::Failed => self.failed += 1,
        }
    }
}

/// How a single item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Result met the threshold (or was forced) and was applied
    Applied,
    /// Result was below threshold and left for review
    NeedsReview,
    /// Retries exhausted or non-retryable; dead-lettered
    Failed,
}

/// A batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: Option<TenantId>,
    pub created_by: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub batch_size: u32,
    pub total_items: u64,
    pub processed_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub pending_review_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped after every recorded batch while running
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec, batch_size: u32, created_by: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: None,
            created_by: created_by.into(),
            spec,
            status: JobStatus::Pending,
            batch_size,
            total_items: 0,
            processed_count: 0,
            succeeded_count: 0,
            failed_count: 0,
            pending_review_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            error_message: None,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_total_items(mut self, total_items: u64) -> Self {
        self.total_items = total_items;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }

    pub fn remaining_items(&self) -> u64 {
        self.total_items.saturating_sub(self.processed_count)
    }

    /// Last sign of life: heartbeat, else start time.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.started_at)
    }

    /// Wall time from start to completion, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Terminal status a fully iterated job ends in.
    pub fn settled_status(&self) -> JobStatus {
        if self.failed_count == 0 {
            JobStatus::Completed
        } else {
            JobStatus::PartiallyFailed
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
    }

    pub fn mark_paused(&mut self) {
        self.status = JobStatus::Paused;
    }

    pub fn mark_resumed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.heartbeat_at = Some(now);
    }

    pub fn apply_batch(&mut self, outcome: &BatchOutcome, now: DateTime<Utc>) {
        self.processed_count += outcome.processed();
        self.succeeded_count += outcome.succeeded;
        self.failed_count += outcome.failed;
        self.pending_review_count += outcome.pending_review;
        self.heartbeat_at = Some(now);
    }

    pub fn mark_finished(&mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        if error.is_some() {
            self.error_message = error;
        }
    }
}

/// Progress view of a single job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job: Job,
    pub progress_percentage: f64,
    pub batches_completed: u64,
    pub batches_remaining: u64,
    /// Only while running and once a rate is known
    pub eta_seconds: Option<u64>,
    pub items_per_second: Option<f64>,
    /// `succeeded / processed`
    pub success_rate: Option<f64>,
    /// Newest first, `item_id: reason`
    pub recent_errors: Vec<String>,
}

impl JobProgress {
    pub fn new(job: Job, recent_errors: Vec<String>, now: DateTime<Utc>) -> Self {
        let batch_size = u64::from(job.batch_size.max(1));
        let total_batches = job.total_items.div_ceil(batch_size);
        let batches_completed = job.processed_count.div_ceil(batch_size).min(total_batches);

        let progress_percentage = if job.total_items > 0 {
            (job.processed_count as f64 * 100.0 / job.total_items as f64).min(100.0)
        } else if job.status.is_terminal() {
            100.0
        } else {
            0.0
        };

        let elapsed_ms = job
            .started_at
            .map(|start| (job.completed_at.unwrap_or(now) - start).num_milliseconds())
            .unwrap_or(0);
        let items_per_second = (elapsed_ms > 0 && job.processed_count > 0)
            .then(|| job.processed_count as f64 / (elapsed_ms as f64 / 1000.0));
        let eta_seconds = match (job.status, items_per_second) {
            (JobStatus::Running, Some(rate)) => {
                Some((job.remaining_items() as f64 / rate).ceil() as u64)
            }
            _ => None,
        };
        let success_rate = (job.processed_count > 0)
            .then(|| job.succeeded_count as f64 / job.processed_count as f64);

        Self {
            progress_percentage,
            batches_completed,
            batches_remaining: total_batches - batches_completed,
            eta_seconds,
            items_per_second,
            success_rate,
            recent_errors,
            job,
        }
    }
}

/// An item that permanently failed processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    /// Owning job, if any
    pub job_id: Option<JobId>,
    pub job_type: Option<JobType>,
    pub tenant_id: Option<TenantId>,
    pub item_id: String,
    /// Snapshot of the item as it was handed to the provider
    pub original_item: JsonValue,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn for_item(
        job: &Job,
        item: &CatalogItem,
        failure_reason: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id: Some(job.id),
            job_type: Some(job.job_type()),
            tenant_id: job.tenant_id,
            item_id: item.id.clone(),
            original_item: serde_json::to_value(item).unwrap_or(JsonValue::Null),
            failure_reason: failure_reason.into(),
            attempt_count,
            moved_at: Utc::now(),
        }
    }
}

/// Aggregate view of the dead-letter store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterSummary {
    pub total: u64,
    pub oldest_moved_at: Option<DateTime<Utc>>,
    pub by_reason: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        for attempt in 1..=policy.max_attempts {
            let nominal = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let got = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((got - nominal).abs() <= nominal * 0.1 + 1.0, "attempt {attempt}: {got}");
        }
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn spec_serializes_with_job_type_tag() {
        let spec = JobSpec::recategorize(["sku-1"], CategorizeConfig::default().forced());
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["job_type"], "targeted_recategorize");
        assert_eq!(json["config"]["force_override"], true);

        let parsed: JobSpec =
            serde_json::from_value(serde_json::json!({"job_type": "full_scan"})).unwrap();
        assert_eq!(parsed, JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default()));
    }

    #[test]
    fn validation_rejects_bad_specs() {
        let bad_threshold = JobSpec::full_scan(
            CatalogFilter::default(),
            CategorizeConfig::default().with_threshold(1.5),
        );
        assert!(bad_threshold.validate().is_err());

        let inverted = JobSpec::full_scan(
            CatalogFilter::default().with_confidence_range(Some(0.8), Some(0.2)),
            CategorizeConfig::default(),
        );
        assert!(inverted.validate().is_err());

        let zero_limit =
            JobSpec::full_scan(CatalogFilter::default().with_limit(0), CategorizeConfig::default());
        assert!(zero_limit.validate().is_err());

        let no_items = JobSpec::recategorize(Vec::<String>::new(), CategorizeConfig::default());
        assert!(no_items.validate().is_err());

        let blank_upload = JobSpec::price_list("  ", ExtractionConfig::default());
        assert!(blank_upload.validate().is_err());

        let nan = JobSpec::full_scan(
            CatalogFilter::default(),
            CategorizeConfig::default().with_threshold(f64::NAN),
        );
        assert!(nan.validate().is_err());
    }

    #[test]
    fn filter_matches_items() {
        let filter = CatalogFilter::default()
            .for_supplier("sup-1")
            .with_status("active")
            .uncategorized_only();

        let item = CatalogItem::new("a").with_supplier("sup-1").with_status("active");
        assert!(filter.matches(&item));
        assert!(!filter.matches(&item.clone().with_category("cat-9", 0.9)));
        assert!(!filter.matches(&item.clone().with_supplier("sup-2")));
        assert!(!filter.matches(&item.with_status("archived")));

        let ranged = CatalogFilter::default().with_confidence_range(Some(0.2), Some(0.6));
        assert!(ranged.matches(&CatalogItem::new("b").with_category("c", 0.4)));
        assert!(!ranged.matches(&CatalogItem::new("c").with_category("c", 0.9)));
        assert!(!ranged.matches(&CatalogItem::new("d")));
    }

    #[test]
    fn presets_follow_job_type() {
        let scan = JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default());
        assert_eq!(scan.preset(), RatePreset::Classify);
        assert_eq!(scan.inference_task(), InferenceTask::Categorize);

        let extract = JobSpec::price_list("up-1", ExtractionConfig::default());
        assert_eq!(extract.preset(), RatePreset::Extract);
        assert_eq!(extract.inference_task(), InferenceTask::ExtractPricing);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(JobStatus::PartiallyFailed.is_terminal());
    }

    #[test]
    fn job_lifecycle_keeps_counters_consistent() {
        let spec = JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default());
        let mut job = Job::new(spec, 2, "alice").with_total_items(3);
        assert_eq!(job.status, JobStatus::Pending);

        let now = Utc::now();
        job.mark_running(now);
        assert_eq!(job.last_seen(), Some(now));

        let mut batch = BatchOutcome::default();
        batch.record(ItemOutcome::Applied);
        batch.record(ItemOutcome::NeedsReview);
        job.apply_batch(&batch, now);

        let mut batch = BatchOutcome::default();
        batch.record(ItemOutcome::Failed);
        job.apply_batch(&batch, now);

        assert_eq!(job.processed_count, 3);
        assert_eq!(job.processed_count, job.succeeded_count + job.failed_count);
        assert_eq!(job.pending_review_count, 1);
        assert_eq!(job.settled_status(), JobStatus::PartiallyFailed);

        job.mark_finished(job.settled_status(), None, now);
        assert!(job.status.is_terminal());
        assert_eq!(job.duration(), Some(chrono::Duration::zero()));
    }

    #[test]
    fn progress_is_derived_from_counters() {
        let spec = JobSpec::full_scan(CatalogFilter::default(), CategorizeConfig::default());
        let start = Utc::now();
        let mut job = Job::new(spec, 2, "alice").with_total_items(5);
        job.mark_running(start);
        job.apply_batch(
            &BatchOutcome {
                succeeded: 3,
                failed: 1,
                pending_review: 0,
            },
            start,
        );

        let later = start + chrono::Duration::seconds(2);
        let progress = JobProgress::new(job.clone(), vec!["item-4: boom".into()], later);
        assert_eq!(progress.progress_percentage, 80.0);
        assert_eq!((progress.batches_completed, progress.batches_remaining), (2, 1));
        assert_eq!(progress.items_per_second, Some(2.0));
        assert_eq!(progress.eta_seconds, Some(1));
        assert_eq!(progress.success_rate, Some(0.75));

        job.mark_paused();
        let paused = JobProgress::new(job, Vec::new(), later);
        assert_eq!(paused.eta_seconds, None);

        let empty = Job::new(JobSpec::recategorize(["a"], CategorizeConfig::default()), 1, "bob");
        let progress = JobProgress::new(empty, Vec::new(), start);
        assert_eq!(progress.progress_percentage, 0.0);
        assert_eq!(progress.items_per_second, None);
        assert_eq!(progress.success_rate, None);
    }
}
