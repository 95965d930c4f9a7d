//! Result sink: where accepted classifications are written back.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use opsflow_ai::{CatalogItem, Classification};
use opsflow_core::JobId;

use super::types::Job;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to apply result for {item_id}: {reason}")]
pub struct SinkError {
    pub item_id: String,
    pub reason: String,
}

impl SinkError {
    pub fn new(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            reason: reason.into(),
        }
    }
}

/// Applies a classification that met the job's threshold (or was forced).
///
/// Results below threshold are never handed to the sink.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn apply(
        &self,
        job: &Job,
        item: &CatalogItem,
        classification: &Classification,
    ) -> Result<(), SinkError>;
}

/// A classification accepted by [`InMemoryResultSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedResult {
    pub job_id: JobId,
    pub item_id: String,
    pub label: String,
    pub confidence: f64,
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    applied: Mutex<Vec<AppliedResult>>,
    rejecting: Mutex<HashSet<String>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AppliedResult> {
        self.applied.lock().unwrap().clone()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<AppliedResult> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Make every write for `item_id` fail.
    pub fn reject_item(&self, item_id: impl Into<String>) {
        self.rejecting.lock().unwrap().insert(item_id.into());
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn apply(
        &self,
        job: &Job,
        item: &CatalogItem,
        classification: &Classification,
    ) -> Result<(), SinkError> {
        if self.rejecting.lock().unwrap().contains(&item.id) {
            return Err(SinkError::new(&item.id, "write rejected"));
        }
        self.applied.lock().unwrap().push(AppliedResult {
            job_id: job.id,
            item_id: item.id.clone(),
            label: classification.label.clone(),
            confidence: classification.confidence,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{CategorizeConfig, JobSpec};

    #[tokio::test]
    async fn records_and_rejects() {
        let sink = InMemoryResultSink::new();
        let job = Job::new(JobSpec::recategorize(["a", "b"], CategorizeConfig::default()), 5, "u");
        let hit = Classification::new("fasteners", 0.9);

        sink.apply(&job, &CatalogItem::new("a"), &hit).await.unwrap();
        sink.reject_item("b");
        let err = sink.apply(&job, &CatalogItem::new("b"), &hit).await.unwrap_err();
        assert_eq!(err.item_id, "b");

        let applied = sink.for_job(job.id);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].label, "fasteners");
    }
}
