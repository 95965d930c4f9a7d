//! Batch categorisation and extraction jobs with retry and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are created `pending`, claimed atomically, and processed in batches
//! - Counters are persisted after every batch; a crash loses at most one batch
//! - Each item gets its own retry budget; exhausted items go to the dead-letter store
//! - Running jobs heartbeat; the reaper fails those that stop
//! - Paused jobs keep their counters and resume from them
//!
//! ## Components
//!
//! - `Job` / `JobSpec`: what to process and how far it got
//! - `JobStore` / `DeadLetterStore`: persistence (in-memory or Postgres)
//! - `EntitySource` / `ResultSink`: where items come from and where results go
//! - `JobManager`: runs jobs against those collaborators
//! - `StaleJobReaper`: recovers jobs whose runner died

pub mod manager;
pub mod postgres;
pub mod reaper;
pub mod sink;
pub mod source;
pub mod store;
pub mod types;

pub use manager::{JobError, JobManager, JobManagerConfig, JobManagerDeps, NewJob, job_identity};
pub use postgres::PostgresJobStore;
pub use reaper::{HEARTBEAT_TIMEOUT, ReaperConfig, StaleJobReaper};
pub use sink::{AppliedResult, InMemoryResultSink, ResultSink, SinkError};
pub use source::{EntitySource, InMemoryEntitySource, SourceError};
pub use store::{DeadLetterStore, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, BatchOutcome, CatalogFilter, CategorizeConfig, DEFAULT_CONFIDENCE_THRESHOLD,
    DeadLetterEntry, DeadLetterSummary, ExtractionConfig, ItemOutcome, ItemScope, Job,
    JobProgress, JobSpec, JobStatus, JobType, RetryPolicy,
};
