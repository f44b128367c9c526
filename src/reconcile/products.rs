//! Source products -> destination create/update payloads.
//!
//! Field ownership on update: the source overwrites catalog content (title,
//! description, options, status, images, its own metadata keys); the
//! destination keeps prices on matched variants and any metadata keys the
//! source does not own. Variants match by SKU, then by the stamped source
//! variant id for variants without a usable SKU. Category links grow, minus
//! links to categories that no longer exist.

use bigdecimal::BigDecimal;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tracing::warn;

use super::identity::IdentityCorrelation;
use crate::catalog::types::{short_id, Metafields, SourceProduct, SourceStatus, SourceVariant};
use crate::destination::{
    DestProduct, DestVariant, ImageInput, Metadata, OptionInput, Price, ProductInput,
    ProductStatus, StoreContext, VariantInput,
};
use crate::normalization::metafields::{boolean, float, string};

#[derive(Debug, Clone, Default)]
pub struct ProductPlan {
    pub to_create: Vec<ProductInput>,
    pub to_update: Vec<ProductInput>,
    /// Collection refs with no destination category yet.
    pub unresolved_categories: usize,
}

pub fn map_status(status: SourceStatus) -> ProductStatus {
    match status {
        SourceStatus::Draft => ProductStatus::Draft,
        _ => ProductStatus::Published,
    }
}

pub fn plan_products(
    source: &[SourceProduct],
    existing: &[DestProduct],
    categories: &HashMap<String, String>,
    ctx: &StoreContext,
    identity: &dyn IdentityCorrelation,
) -> ProductPlan {
    let mut by_key: HashMap<&str, &DestProduct> = HashMap::new();
    for p in existing {
        if let Some(key) = identity.product_key(p) {
            by_key.entry(key).or_insert(p);
        }
    }

    let mut plan = ProductPlan::default();
    let mut seen: HashSet<&str> = HashSet::new();
    for product in source {
        let external_id = short_id(&product.id);
        if !seen.insert(external_id) {
            warn!(id = %product.id, "source product listed twice; ignoring repeat");
            continue;
        }
        let current = by_key.get(external_id).copied();

        let mut category_ids: Vec<String> = current
            .map(|c| c.category_ids.clone())
            .unwrap_or_default();
        for col in &product.collections {
            match categories.get(&col.id) {
                Some(cat) if !category_ids.contains(cat) => category_ids.push(cat.clone()),
                Some(_) => {}
                None => plan.unresolved_categories += 1,
            }
        }

        let input = build_input(product, external_id, current, category_ids, ctx, identity);
        if current.is_some() {
            plan.to_update.push(input);
        } else {
            plan.to_create.push(input);
        }
    }
    plan
}

fn build_input(
    product: &SourceProduct,
    external_id: &str,
    current: Option<&DestProduct>,
    category_ids: Vec<String>,
    ctx: &StoreContext,
    identity: &dyn IdentityCorrelation,
) -> ProductInput {
    let mf = &product.metafields;
    let mut metadata = current.map(|c| c.metadata.clone()).unwrap_or_default();
    set_opt(&mut metadata, "bx_code", string(mf, "bx_code").map(Value::String));
    set_opt(&mut metadata, "b2box_verified", boolean(mf, "verified").map(Value::Bool));
    set_opt(&mut metadata, "verified_video", string(mf, "verified_video").map(Value::String));
    set_opt(&mut metadata, "product_video", string(mf, "product_video").map(Value::String));
    identity.stamp(&mut metadata, external_id);

    let existing_variants: &[DestVariant] = current.map(|c| c.variants.as_slice()).unwrap_or(&[]);
    let mut claimed: HashSet<&str> = HashSet::new();

    ProductInput {
        id: current.map(|c| c.id.clone()),
        external_id: external_id.to_string(),
        title: product.title.clone(),
        subtitle: string(mf, "bx_code"),
        description: product.description.clone().unwrap_or_default(),
        status: map_status(product.status),
        options: product
            .options
            .iter()
            .map(|o| OptionInput {
                title: o.name.clone(),
                values: o.values.clone(),
            })
            .collect(),
        images: product
            .images
            .iter()
            .map(|img| {
                let mut metadata = Metadata::new();
                identity.stamp(&mut metadata, &img.id);
                ImageInput {
                    url: img.url.clone(),
                    metadata,
                }
            })
            .collect(),
        metadata,
        variants: product
            .variants
            .iter()
            .map(|v| {
                let matched = match_variant(v, existing_variants, &mut claimed, identity);
                build_variant(v, matched, ctx, identity)
            })
            .collect(),
        sales_channel_ids: ctx.default_sales_channel_id.iter().cloned().collect(),
        category_ids,
    }
}

/// SKU first; otherwise the variant stamped with this source id. Each
/// destination variant is claimed at most once.
fn match_variant<'a>(
    v: &SourceVariant,
    existing: &'a [DestVariant],
    claimed: &mut HashSet<&'a str>,
    identity: &dyn IdentityCorrelation,
) -> Option<&'a DestVariant> {
    let free = |e: &&DestVariant| !claimed.contains(e.id.as_str());
    let hit = v
        .sku
        .as_deref()
        .and_then(|sku| existing.iter().filter(free).find(|e| e.sku.as_deref() == Some(sku)))
        .or_else(|| {
            existing
                .iter()
                .filter(free)
                .find(|e| identity.variant_key(e) == Some(v.id.as_str()))
        });
    if let Some(e) = hit {
        claimed.insert(e.id.as_str());
    }
    hit
}

fn build_variant(
    v: &SourceVariant,
    matched: Option<&DestVariant>,
    ctx: &StoreContext,
    identity: &dyn IdentityCorrelation,
) -> VariantInput {

    let prices = match matched {
        Some(m) if !m.prices.is_empty() => m.prices.clone(),
        _ => seed_prices(&v.price, ctx),
    };

    let mf = &v.metafields;
    let mut metadata = matched.map(|m| m.metadata.clone()).unwrap_or_default();
    metadata.insert(
        "product".into(),
        Value::Object(dimensions(mf, "product", &["width", "length", "height", "weight"])),
    );
    metadata.insert(
        "box".into(),
        Value::Object(dimensions(mf, "box", &["width", "height", "length", "weight"])),
    );
    set_opt(&mut metadata, "pa_code", string(mf, "pa_code").map(Value::String));
    set_opt(&mut metadata, "has_battery", boolean(mf, "battery").map(Value::Bool));
    set_opt(&mut metadata, "is_clothing", boolean(mf, "fabric").map(Value::Bool));
    identity.stamp(&mut metadata, &v.id);

    VariantInput {
        id: matched.map(|m| m.id.clone()),
        title: v.title.clone(),
        sku: v.sku.clone(),
        manage_inventory: false,
        prices,
        material: string(mf, "material"),
        metadata,
        options: v
            .selected_options
            .iter()
            .map(|s| (s.name.clone(), s.value.clone()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Same amount in every currency the store supports.
fn seed_prices(raw: &str, ctx: &StoreContext) -> Vec<Price> {
    let Ok(amount) = BigDecimal::from_str(raw.trim()) else {
        warn!(price = %raw, "unparseable source price; variant gets no prices");
        return Vec::new();
    };
    ctx.supported_currencies
        .iter()
        .map(|code| Price {
            amount: amount.clone(),
            currency_code: code.clone(),
        })
        .collect()
}

/// `{prefix}_{field}` float metafields as a nested object; absent values are omitted.
fn dimensions(mf: &Metafields, prefix: &str, fields: &[&str]) -> Metadata {
    let mut out = Metadata::new();
    for field in fields {
        if let Some(n) = float(mf, &format!("{prefix}_{field}")).and_then(Number::from_f64) {
            out.insert((*field).to_string(), Value::Number(n));
        }
    }
    out
}

/// Source-owned key: written when present, removed when the source has no value.
fn set_opt(metadata: &mut Metadata, key: &str, value: Option<Value>) {
    match value {
        Some(v) => {
            metadata.insert(key.to_string(), v);
        }
        None => {
            metadata.remove(key);
        }
    }
}
