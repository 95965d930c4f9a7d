use async_trait::async_trait;

use crate::item::{CatalogItem, InferenceRequest};
use crate::result::{AiError, Classification};

/// External classification / extraction backend.
///
/// Implementations wrap an LLM or rules engine. They must not mutate the
/// catalog; applying a result is the caller's decision.
#[async_trait]
pub trait ClassificationProvider: Send + Sync + 'static {
    /// Short name used in logs and dead-letter context.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        item: &CatalogItem,
        request: &InferenceRequest,
    ) -> Result<Classification, AiError>;
}

/// Provider backed by a synchronous closure.
///
/// Handy for rule-based classifiers and for wiring tests without a model.
pub struct FnProvider<F> {
    name: String,
    f: F,
}

impl<F> FnProvider<F>
where
    F: Fn(&CatalogItem, &InferenceRequest) -> Result<Classification, AiError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> core::fmt::Debug for FnProvider<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnProvider").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> ClassificationProvider for FnProvider<F>
where
    F: Fn(&CatalogItem, &InferenceRequest) -> Result<Classification, AiError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(
        &self,
        item: &CatalogItem,
        request: &InferenceRequest,
    ) -> Result<Classification, AiError> {
        (self.f)(item, request)
    }
}
