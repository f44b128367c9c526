use serde_json::Value;

use crate::destination::{
    CategoryFilter, DestCategory, DestProduct, DestVariant, Metadata, MetadataFilter,
    ProductFilter,
};

/// Metadata key holding the source identity on destination records.
pub const EXTERNAL_ID_KEY: &str = "external_id";

/// How destination records are tied back to source identities.
pub trait IdentityCorrelation: Send + Sync {
    fn product_filter(&self, external_ids: Vec<String>) -> ProductFilter;

    fn category_filter(&self, external_ids: Vec<String>) -> CategoryFilter;

    fn product_key<'a>(&self, product: &'a DestProduct) -> Option<&'a str>;

    fn category_key<'a>(&self, category: &'a DestCategory) -> Option<&'a str>;

    /// Fallback key for variants that cannot be matched by SKU.
    fn variant_key<'a>(&self, variant: &'a DestVariant) -> Option<&'a str>;

    /// Tag outgoing metadata with `external_id`.
    fn stamp(&self, metadata: &mut Metadata, external_id: &str);
}

/// Identity kept in a metadata side-channel under [`EXTERNAL_ID_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataCorrelation;

impl MetadataCorrelation {
    fn filter(values: Vec<String>) -> MetadataFilter {
        MetadataFilter {
            key: EXTERNAL_ID_KEY.to_string(),
            values,
        }
    }
}

fn metadata_key(metadata: &Metadata) -> Option<&str> {
    metadata.get(EXTERNAL_ID_KEY).and_then(Value::as_str)
}

impl IdentityCorrelation for MetadataCorrelation {
    fn product_filter(&self, external_ids: Vec<String>) -> ProductFilter {
        ProductFilter {
            metadata: Some(Self::filter(external_ids)),
            ..ProductFilter::default()
        }
    }

    fn category_filter(&self, external_ids: Vec<String>) -> CategoryFilter {
        CategoryFilter {
            metadata: Some(Self::filter(external_ids)),
            ..CategoryFilter::default()
        }
    }

    fn product_key<'a>(&self, product: &'a DestProduct) -> Option<&'a str> {
        metadata_key(&product.metadata)
    }

    fn category_key<'a>(&self, category: &'a DestCategory) -> Option<&'a str> {
        metadata_key(&category.metadata)
    }

    fn variant_key<'a>(&self, variant: &'a DestVariant) -> Option<&'a str> {
        metadata_key(&variant.metadata)
    }

    fn stamp(&self, metadata: &mut Metadata, external_id: &str) {
        metadata.insert(
            EXTERNAL_ID_KEY.to_string(),
            Value::String(external_id.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::ProductStatus;

    #[test]
    fn stamped_products_are_found_by_their_filter() {
        let corr = MetadataCorrelation;
        let mut metadata = Metadata::new();
        corr.stamp(&mut metadata, "123");
        let product = DestProduct {
            id: "prod_1".into(),
            external_id: None,
            title: "Lamp".into(),
            status: ProductStatus::Published,
            metadata,
            variants: vec![],
            category_ids: vec![],
        };
        assert_eq!(corr.product_key(&product), Some("123"));
        assert!(corr.product_filter(vec!["123".into()]).matches(&product));
        assert!(!corr.product_filter(vec!["456".into()]).matches(&product));
    }
}
