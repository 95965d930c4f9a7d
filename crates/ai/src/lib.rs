//! `opsflow-ai`
//!
//! The boundary between the batch pipeline and the AI backends it calls.
//!
//! - Providers classify or extract; they never mutate catalog state.
//! - Results carry a confidence so callers can decide whether to apply them.
//! - Failures are typed and say whether a retry can help.

pub mod item;
pub mod provider;
pub mod result;

pub use item::{CatalogItem, InferenceRequest, InferenceTask};
pub use provider::{ClassificationProvider, FnProvider};
pub use result::{AiError, Classification};
