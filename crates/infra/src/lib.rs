//! Batch job pipeline: rate limiting, background tasks, batch jobs with
//! dead-lettering, and monitoring.
//!
//! - [`rate_limit`]: fixed-window admission per caller identity and preset
//! - [`task_queue`]: fire-and-poll background tasks with a retention TTL
//! - [`jobs`]: batch job lifecycle, stores, reaper
//! - [`monitor`]: metrics, health, dashboard
//! - [`pipeline`]: assembly of the above from a [`config::PipelineConfig`]

pub mod config;
pub mod jobs;
pub mod monitor;
pub mod pipeline;
pub mod rate_limit;
pub mod task_queue;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PipelineDeps};

#[cfg(test)]
mod test_support;
