//! Destination commerce store: the query and write collaborator the
//! reconciliation engine talks to.
//!
//! Writes are applied one item at a time; a failing item is reported in the
//! [`WriteReport`] and never rolls back its siblings.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StoreError;

pub mod memory;
pub mod pg;

pub use memory::MemoryCatalogStore;
pub use pg::PgCatalogStore;

pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Draft,
    Published,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Published => "published",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("draft") {
            ProductStatus::Draft
        } else {
            ProductStatus::Published
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: BigDecimal,
    pub currency_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreContext {
    pub supported_currencies: Vec<String>,
    pub default_sales_channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestCategory {
    pub id: String,
    pub name: String,
    pub handle: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestVariant {
    pub id: String,
    pub title: String,
    pub sku: Option<String>,
    pub prices: Vec<Price>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestProduct {
    pub id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub status: ProductStatus,
    pub metadata: Metadata,
    pub variants: Vec<DestVariant>,
    pub category_ids: Vec<String>,
}

/// Match on a nested metadata key. An empty `values` list matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl MetadataFilter {
    pub fn matches(&self, metadata: &Metadata) -> bool {
        metadata
            .get(&self.key)
            .and_then(Value::as_str)
            .is_some_and(|v| self.values.iter().any(|x| x == v))
    }
}

/// Categories whose handle is listed OR whose metadata matches. No criteria
/// at all selects every category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    pub handles: Option<Vec<String>>,
    pub metadata: Option<MetadataFilter>,
    pub skip: usize,
    pub take: Option<usize>,
}

impl CategoryFilter {
    pub fn matches(&self, category: &DestCategory) -> bool {
        if self.handles.is_none() && self.metadata.is_none() {
            return true;
        }
        let by_handle = self
            .handles
            .as_ref()
            .is_some_and(|hs| hs.iter().any(|h| *h == category.handle));
        let by_metadata = self
            .metadata
            .as_ref()
            .is_some_and(|m| m.matches(&category.metadata));
        by_handle || by_metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub metadata: Option<MetadataFilter>,
    pub skip: usize,
    pub take: Option<usize>,
}

impl ProductFilter {
    pub fn matches(&self, product: &DestProduct) -> bool {
        self.metadata
            .as_ref()
            .map_or(true, |m| m.matches(&product.metadata))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total matches before pagination.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCreate {
    pub name: String,
    pub handle: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionInput {
    pub title: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInput {
    pub url: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantInput {
    /// Existing destination variant, when matched by SKU.
    pub id: Option<String>,
    pub title: String,
    pub sku: Option<String>,
    pub manage_inventory: bool,
    pub prices: Vec<Price>,
    pub material: Option<String>,
    pub metadata: Metadata,
    pub options: BTreeMap<String, String>,
}

/// Full product payload. `id` is set for updates and absent for creates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductInput {
    pub id: Option<String>,
    pub external_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: String,
    pub status: ProductStatus,
    pub options: Vec<OptionInput>,
    pub images: Vec<ImageInput>,
    pub metadata: Metadata,
    pub variants: Vec<VariantInput>,
    pub sales_channel_ids: Vec<String>,
    pub category_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Destination ids written, in input order.
    pub written: Vec<String>,
    pub failed: Vec<WriteFailure>,
}

impl WriteReport {
    pub fn merge(&mut self, other: WriteReport) {
        self.written.extend(other.written);
        self.failed.extend(other.failed);
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn store_context(&self) -> Result<StoreContext, StoreError>;

    async fn find_categories(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Page<DestCategory>, StoreError>;

    async fn find_products(&self, filter: &ProductFilter) -> Result<Page<DestProduct>, StoreError>;

    async fn create_categories(&self, batch: &[CategoryCreate]) -> Result<WriteReport, StoreError>;

    async fn create_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError>;

    /// Overwrites the listed fields; variants without an `id` are added,
    /// destination variants missing from the payload are left alone.
    async fn update_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError>;
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Metadata {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn empty_metadata_filter_matches_nothing() {
        let f = MetadataFilter {
            key: "external_id".into(),
            values: vec![],
        };
        assert!(!f.matches(&meta(json!({"external_id": "1"}))));
    }

    #[test]
    fn category_filter_is_handle_or_metadata() {
        let cat = DestCategory {
            id: "pcat_1".into(),
            name: "Lighting".into(),
            handle: "lighting".into(),
            metadata: meta(json!({"external_id": "gid://shopify/Collection/1"})),
        };
        assert!(CategoryFilter::default().matches(&cat));
        let by_handle = CategoryFilter {
            handles: Some(vec!["lighting".into()]),
            ..Default::default()
        };
        assert!(by_handle.matches(&cat));
        let by_meta = CategoryFilter {
            handles: Some(vec!["other".into()]),
            metadata: Some(MetadataFilter {
                key: "external_id".into(),
                values: vec!["gid://shopify/Collection/1".into()],
            }),
            ..Default::default()
        };
        assert!(by_meta.matches(&cat));
        let none = CategoryFilter {
            handles: Some(vec![]),
            ..Default::default()
        };
        assert!(!none.matches(&cat));
    }

    #[test]
    fn ids_carry_prefix() {
        let id = new_id("prod");
        assert!(id.starts_with("prod_"));
        assert_eq!(id.len(), "prod_".len() + 32);
    }
}
