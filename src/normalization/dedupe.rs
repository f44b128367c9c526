//! Catalog normalizer: title cleanup, natural-key de-duplication and SKU
//! uniqueness before anything reaches the destination.
//!
//! Policy: the first occurrence (in root order) of a cleaned title wins and
//! later duplicates are dropped whole. Repeated SKUs are cleared on every
//! variant after the first, but those variants stay. Everything removed or
//! cleared is listed in the [`NormalizeReport`].

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use super::metafields::flatten;
use super::title::clean_title;
use crate::catalog::assemble::{CollectionNode, ProductNode, VariantNode};
use crate::catalog::types::{SourceCollection, SourceProduct, SourceStatus, SourceVariant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedEntity {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearedSku {
    pub product_id: String,
    pub variant_id: String,
    pub sku: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub removed_products: Vec<RemovedEntity>,
    pub removed_collections: Vec<RemovedEntity>,
    pub cleared_skus: Vec<ClearedSku>,
    pub dropped_option_selections: usize,
}

impl NormalizeReport {
    pub fn merge(&mut self, other: NormalizeReport) {
        self.removed_products.extend(other.removed_products);
        self.removed_collections.extend(other.removed_collections);
        self.cleared_skus.extend(other.cleared_skus);
        self.dropped_option_selections += other.dropped_option_selections;
    }
}

/// Assembled product trees -> cleaned, de-duplicated source products.
pub fn normalize_products(nodes: Vec<ProductNode>) -> (Vec<SourceProduct>, NormalizeReport) {
    let products = nodes.into_iter().map(product_from_node).collect();
    dedupe_products(products)
}

pub fn normalize_collections(
    nodes: Vec<CollectionNode>,
) -> (Vec<SourceCollection>, NormalizeReport) {
    let collections = nodes
        .into_iter()
        .map(|n| SourceCollection {
            id: n.id,
            title: n.title,
            handle: n.handle.filter(|h| !h.trim().is_empty()),
            description: n.description_html.filter(|d| !d.trim().is_empty()),
        })
        .collect();
    dedupe_collections(collections)
}

fn product_from_node(node: ProductNode) -> SourceProduct {
    SourceProduct {
        metafields: flatten(&node.metafields),
        status: SourceStatus::parse(node.status.as_deref()),
        description: node.description_html.filter(|d| !d.trim().is_empty()),
        variants: node.variants.into_iter().map(variant_from_node).collect(),
        id: node.id,
        title: node.title,
        options: node.options,
        tags: node.tags,
        images: node.images,
        collections: node.collections,
    }
}

fn variant_from_node(node: VariantNode) -> SourceVariant {
    SourceVariant {
        metafields: flatten(&node.metafields),
        sku: node.sku,
        id: node.id,
        title: node.title,
        price: node.price,
        inventory_quantity: node.inventory_quantity,
        selected_options: node.selected_options,
    }
}

/// Idempotent: running it over its own output changes nothing.
pub fn dedupe_products(products: Vec<SourceProduct>) -> (Vec<SourceProduct>, NormalizeReport) {
    let mut report = NormalizeReport::default();
    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut kept: Vec<SourceProduct> = Vec::with_capacity(products.len());

    for mut product in products {
        product.title = clean_title(&product.title);
        if !seen_titles.insert(product.title.clone()) {
            debug!(id = %product.id, title = %product.title, "dropping duplicate product title");
            report.removed_products.push(RemovedEntity {
                id: product.id,
                title: product.title,
            });
            continue;
        }
        let mut seen_collections: HashSet<String> = HashSet::new();
        product
            .collections
            .retain(|c| seen_collections.insert(c.id.clone()));
        report.dropped_option_selections += prune_option_selections(&mut product);
        kept.push(product);
    }

    let mut seen_skus: HashSet<String> = HashSet::new();
    for product in &mut kept {
        for variant in &mut product.variants {
            let Some(sku) = variant.sku.take().map(|s| s.trim().to_string()) else {
                continue;
            };
            if sku.is_empty() {
                continue;
            }
            if seen_skus.insert(sku.clone()) {
                variant.sku = Some(sku);
            } else {
                debug!(variant = %variant.id, %sku, "clearing duplicate sku");
                report.cleared_skus.push(ClearedSku {
                    product_id: product.id.clone(),
                    variant_id: variant.id.clone(),
                    sku,
                });
            }
        }
    }

    if !report.removed_products.is_empty() || !report.cleared_skus.is_empty() {
        info!(
            kept = kept.len(),
            removed_duplicates = report.removed_products.len(),
            cleared_skus = report.cleared_skus.len(),
            "normalized products"
        );
    }
    (kept, report)
}

pub fn dedupe_collections(
    collections: Vec<SourceCollection>,
) -> (Vec<SourceCollection>, NormalizeReport) {
    let mut report = NormalizeReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(collections.len());
    for mut c in collections {
        c.title = clean_title(&c.title);
        if seen.insert(c.title.clone()) {
            kept.push(c);
        } else {
            report.removed_collections.push(RemovedEntity {
                id: c.id,
                title: c.title,
            });
        }
    }
    if !report.removed_collections.is_empty() {
        info!(
            kept = kept.len(),
            removed_duplicates = report.removed_collections.len(),
            "normalized collections"
        );
    }
    (kept, report)
}

/// Drop variant option selections that name an option the product never declared.
fn prune_option_selections(product: &mut SourceProduct) -> usize {
    let declared: HashSet<&str> = product.options.iter().map(|o| o.name.as_str()).collect();
    let mut dropped = 0;
    for variant in &mut product.variants {
        let before = variant.selected_options.len();
        variant
            .selected_options
            .retain(|s| declared.contains(s.name.as_str()));
        dropped += before - variant.selected_options.len();
    }
    dropped
}
