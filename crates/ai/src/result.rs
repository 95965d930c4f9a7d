use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Outcome of classifying (or extracting from) one catalog item.
///
/// This is an insight, not a mutation: whether it gets applied is decided by
/// the job that requested it, based on `confidence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Assigned category (categorisation) or extracted value key (extraction).
    pub label: String,

    /// Confidence in \[0, 1\]. Values outside the range are clamped on construction.
    pub confidence: f64,

    pub explanation: Option<String>,

    /// Provider-specific details (model name, token usage, extracted fields).
    pub metadata: JsonValue,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label: label.into(),
            confidence,
            explanation: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether this result clears `threshold`.
    pub fn meets(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Typed provider failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AiError {
    /// The item cannot be processed as given; retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AiError {
    /// Transient failures are worth another attempt; bad input is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AiError::InvalidInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(Classification::new("x", 1.7).confidence, 1.0);
        assert_eq!(Classification::new("x", -0.2).confidence, 0.0);
        assert_eq!(Classification::new("x", f64::NAN).confidence, 0.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let c = Classification::new("cables", 0.7);
        assert!(c.meets(0.7));
        assert!(!c.meets(0.71));
    }

    #[test]
    fn only_invalid_input_is_permanent() {
        assert!(!AiError::InvalidInput("empty name".into()).is_retryable());
        assert!(AiError::InferenceFailed("503".into()).is_retryable());
        assert!(AiError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(AiError::Internal("oops".into()).is_retryable());
    }
}
