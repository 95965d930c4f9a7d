use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use opsflow_core::TenantId;

/// A catalog entity handed to a provider.
///
/// Only the fields the pipeline filters on are typed; everything else the
/// provider needs travels in `attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub supplier_id: Option<String>,
    /// Price-list upload this row came from, if any.
    pub upload_id: Option<String>,
    /// Categorisation status as tracked by the catalog (e.g. `pending`, `failed`).
    pub status: Option<String>,
    pub category_id: Option<String>,
    /// Confidence of the current categorisation, if any.
    pub confidence: Option<f64>,
    pub attributes: JsonValue,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            supplier_id: None,
            upload_id: None,
            status: None,
            category_id: None,
            confidence: None,
            attributes: JsonValue::Null,
        }
    }

    pub fn with_supplier(mut self, supplier_id: impl Into<String>) -> Self {
        self.supplier_id = Some(supplier_id.into());
        self
    }

    pub fn with_upload(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>, confidence: f64) -> Self {
        self.category_id = Some(category_id.into());
        self.confidence = Some(confidence);
        self
    }

    pub fn with_attributes(mut self, attributes: JsonValue) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_categorized(&self) -> bool {
        self.category_id.is_some()
    }
}

/// What the provider is asked to do with an item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceTask {
    Categorize,
    ExtractPricing,
}

/// Per-call parameters for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub task: InferenceTask,
    pub tenant_id: Option<TenantId>,
    /// Preferred model, if the job pinned one.
    pub model: Option<String>,
    /// 1-based attempt number for this item.
    pub attempt: u32,
}

impl InferenceRequest {
    pub fn new(task: InferenceTask) -> Self {
        Self {
            task,
            tenant_id: None,
            model: None,
            attempt: 1,
        }
    }

    pub fn for_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}
