//! Domain error model.

use thiserror::Error;

/// Result type used by validation and state-transition code.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures raised before or during a state change.
///
/// Infrastructure failures (store or provider outages) have their own error
/// types in `opsflow-infra` and `opsflow-ai`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request failed validation (e.g. batch size out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lifecycle invariant was violated (e.g. leaving a terminal status).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found")]
    NotFound,

    /// A concurrent writer got there first.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
