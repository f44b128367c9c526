//! Normalized source entities, held in memory for one reconciliation pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flattened metafields: key -> raw string value.
pub type Metafields = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    #[default]
    Active,
    Draft,
    Archived,
    Unlisted,
}

impl SourceStatus {
    /// Lenient parse of the platform's status enum; unknown values read as active.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("DRAFT") => SourceStatus::Draft,
            Some("ARCHIVED") => SourceStatus::Archived,
            Some("UNLISTED") => SourceStatus::Unlisted,
            _ => SourceStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceImage {
    pub id: String,
    pub url: String,
    pub alt: Option<String>,
}

/// Option definition declared on a product (e.g. `Size: [S, M, L]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOption {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedOption {
    pub name: String,
    pub value: String,
}

/// A product's membership in a source collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceVariant {
    pub id: String,
    pub title: String,
    /// Unique across the catalog after normalization.
    pub sku: Option<String>,
    /// Decimal kept as the platform's string to avoid float rounding.
    pub price: String,
    pub inventory_quantity: Option<i64>,
    pub selected_options: Vec<SelectedOption>,
    pub metafields: Metafields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProduct {
    pub id: String,
    pub title: String,
    pub status: SourceStatus,
    pub description: Option<String>,
    pub options: Vec<ProductOption>,
    pub tags: Vec<String>,
    pub metafields: Metafields,
    pub images: Vec<SourceImage>,
    pub variants: Vec<SourceVariant>,
    pub collections: Vec<CollectionRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCollection {
    pub id: String,
    pub title: String,
    pub handle: Option<String>,
    pub description: Option<String>,
}

/// Trailing segment of a platform gid: `gid://shopify/Product/123` -> `123`.
pub fn short_id(gid: &str) -> &str {
    gid.rsplit('/').next().unwrap_or(gid)
}
