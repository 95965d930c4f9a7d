//! `opsflow-core`: identifiers and error types shared by the batch pipeline.
//!
//! This crate is pure: no IO, no runtime.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, JobId, TaskId, TenantId, UserId};
