//! One line of a bulk export stream.
//!
//! Nested connections are flattened by the platform: every child line carries
//! `__parentId` pointing at its owner. The record type is read from an explicit
//! `__typename` when the query asked for one, otherwise it is sniffed from the
//! identity string by [`classify`].

use serde_json::Value;
use thiserror::Error;

pub const PARENT_FIELD: &str = "__parentId";
pub const TYPENAME_FIELD: &str = "__typename";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Product,
    Collection,
    Image,
    Variant,
    Metafield,
    Unknown,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Product => "product",
            RecordKind::Collection => "collection",
            RecordKind::Image => "image",
            RecordKind::Variant => "variant",
            RecordKind::Metafield => "metafield",
            RecordKind::Unknown => "unknown",
        }
    }
}

/// Classify a record from the type marker embedded in its identity.
///
/// `gid://shopify/ProductImage/1` -> `Image`. Only the type segment of a gid is
/// inspected so numeric ids can never match a marker. Order matters: composite
/// names such as `ProductVariant` must resolve before the bare `Product` marker.
pub fn classify(id: &str) -> RecordKind {
    let type_segment = id
        .strip_prefix("gid://")
        .and_then(|rest| rest.split('/').nth(1))
        .unwrap_or(id);
    classify_type_name(type_segment)
}

fn classify_type_name(name: &str) -> RecordKind {
    if name.contains("Metafield") {
        RecordKind::Metafield
    } else if name.contains("Image") {
        RecordKind::Image
    } else if name.contains("Variant") {
        RecordKind::Variant
    } else if name.contains("Collection") {
        RecordKind::Collection
    } else if name.contains("Product") {
        RecordKind::Product
    } else {
        RecordKind::Unknown
    }
}

#[derive(Debug, Error)]
pub enum FlatRecordError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record has no string `id`")]
    MissingId,
}

#[derive(Debug, Clone)]
pub struct FlatRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: RecordKind,
    pub body: Value,
}

impl FlatRecord {
    pub fn parse(line: &str) -> Result<Self, FlatRecordError> {
        let body: Value = serde_json::from_str(line)?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or(FlatRecordError::MissingId)?
            .to_string();
        let parent_id = body
            .get(PARENT_FIELD)
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let kind = match body.get(TYPENAME_FIELD).and_then(Value::as_str) {
            Some(name) => classify_type_name(name),
            None => classify(&id),
        };
        Ok(Self {
            id,
            parent_id,
            kind,
            body,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn str_field(&self, key: &str) -> Option<String> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gid_type_segments() {
        assert_eq!(classify("gid://shopify/Product/1"), RecordKind::Product);
        assert_eq!(classify("gid://shopify/ProductImage/1"), RecordKind::Image);
        assert_eq!(classify("gid://shopify/MediaImage/1"), RecordKind::Image);
        assert_eq!(classify("gid://shopify/ProductVariant/1"), RecordKind::Variant);
        assert_eq!(classify("gid://shopify/Metafield/1"), RecordKind::Metafield);
        assert_eq!(classify("gid://shopify/Collection/1"), RecordKind::Collection);
        assert_eq!(classify("gid://shopify/Order/1"), RecordKind::Unknown);
    }

    #[test]
    fn classify_falls_back_to_whole_identity() {
        assert_eq!(classify("VariantABC"), RecordKind::Variant);
        assert_eq!(classify("gid://1"), RecordKind::Unknown);
    }

    #[test]
    fn explicit_typename_wins_over_identity() {
        let rec = FlatRecord::parse(
            r#"{"id":"gid://shopify/Thing/1","__typename":"ProductVariant","__parentId":"gid://shopify/Product/1"}"#,
        )
        .unwrap();
        assert_eq!(rec.kind, RecordKind::Variant);
        assert_eq!(rec.parent_id.as_deref(), Some("gid://shopify/Product/1"));
        assert!(!rec.is_root());
    }

    #[test]
    fn rejects_records_without_id() {
        assert!(matches!(
            FlatRecord::parse(r#"{"title":"x"}"#),
            Err(FlatRecordError::MissingId)
        ));
        assert!(matches!(
            FlatRecord::parse("not json"),
            Err(FlatRecordError::Json(_))
        ));
    }
}
