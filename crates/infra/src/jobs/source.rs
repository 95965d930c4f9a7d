//! Entity source: resolves a job's scope into a count and stable pages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use opsflow_ai::CatalogItem;
use opsflow_core::TenantId;

use super::types::ItemScope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("entity source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
}

/// Where a job's items come from.
///
/// Pages must follow a stable order so that offset paging visits every item
/// exactly once while the scope does not change.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn count(&self, tenant_id: Option<TenantId>, scope: &ItemScope<'_>) -> Result<u64, SourceError>;

    async fn page(
        &self,
        tenant_id: Option<TenantId>,
        scope: &ItemScope<'_>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, SourceError>;
}

/// Catalog held in memory, in insertion order.
#[derive(Debug)]
pub struct InMemoryEntitySource {
    items: RwLock<Vec<CatalogItem>>,
    available: AtomicBool,
}

impl InMemoryEntitySource {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items: RwLock::new(items),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc(items: Vec<CatalogItem>) -> Arc<Self> {
        Arc::new(Self::new(items))
    }

    pub fn push(&self, item: CatalogItem) {
        self.items.write().unwrap().push(item);
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SourceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SourceError::Unavailable("catalog offline".into()))
        }
    }

    fn in_scope(&self, scope: &ItemScope<'_>) -> Vec<CatalogItem> {
        let items = self.items.read().unwrap();
        match scope {
            ItemScope::Filter(filter) => {
                let matching = items.iter().filter(|i| filter.matches(i)).cloned();
                match filter.limit {
                    Some(limit) => matching.take(limit as usize).collect(),
                    None => matching.collect(),
                }
            }
            // Requested order, unknown ids skipped.
            ItemScope::Items(ids) => ids
                .iter()
                .filter_map(|id| items.iter().find(|i| &i.id == id).cloned())
                .collect(),
            ItemScope::Upload(upload) => items
                .iter()
                .filter(|i| i.upload_id.as_deref() == Some(*upload))
                .cloned()
                .collect(),
        }
    }
}

impl Default for InMemoryEntitySource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl EntitySource for InMemoryEntitySource {
    async fn count(&self, _tenant_id: Option<TenantId>, scope: &ItemScope<'_>) -> Result<u64, SourceError> {
        self.check()?;
        Ok(self.in_scope(scope).len() as u64)
    }

    async fn page(
        &self,
        _tenant_id: Option<TenantId>,
        scope: &ItemScope<'_>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        self.check()?;
        Ok(self
            .in_scope(scope)
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .collect())
    }
}
