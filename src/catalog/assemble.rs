//! Rebuilds nested entities from a flat, parent-tagged bulk export stream.
//!
//! The stream is not guaranteed to be parent-before-child, so assembly is
//! multi-pass over an identity -> node arena:
//!   1. every record without a parent becomes a root
//!   2. images / variants / collection links attach to their root by parent id
//!   3. metafields attach to the owning variant (searched across all roots),
//!      falling back to a root owner
//!
//! Children whose owner never appears are dropped and counted per kind in the
//! [`AssemblyReport`].

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::flat::{FlatRecord, RecordKind};
use super::types::{CollectionRef, ProductOption, SelectedOption, SourceImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Products,
    Collections,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetafieldRecord {
    pub id: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantNode {
    pub id: String,
    pub title: String,
    pub sku: Option<String>,
    pub price: String,
    pub inventory_quantity: Option<i64>,
    pub selected_options: Vec<SelectedOption>,
    pub metafields: Vec<MetafieldRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductNode {
    pub id: String,
    pub title: String,
    pub status: Option<String>,
    pub description_html: Option<String>,
    pub tags: Vec<String>,
    pub options: Vec<ProductOption>,
    pub images: Vec<SourceImage>,
    pub variants: Vec<VariantNode>,
    pub collections: Vec<CollectionRef>,
    pub metafields: Vec<MetafieldRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionNode {
    pub id: String,
    pub title: String,
    pub handle: Option<String>,
    pub description_html: Option<String>,
    /// Member product ids, when the export asked for them.
    pub members: Vec<String>,
    pub metafields: Vec<MetafieldRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyReport {
    pub lines: usize,
    pub roots: usize,
    pub attached: usize,
    pub malformed: usize,
    pub duplicate_roots: usize,
    /// Dropped children keyed by record kind.
    pub orphans: BTreeMap<String, usize>,
}

impl AssemblyReport {
    pub fn orphan_total(&self) -> usize {
        self.orphans.values().sum()
    }

    fn orphan(&mut self, rec: &FlatRecord) {
        debug!(id = %rec.id, parent = ?rec.parent_id, kind = rec.kind.as_str(), "dropping orphaned record");
        *self.orphans.entry(rec.kind.as_str().to_string()).or_insert(0) += 1;
    }

    fn log(&self, kind: EntityKind) {
        if self.orphan_total() > 0 || self.malformed > 0 {
            warn!(
                ?kind,
                orphans = ?self.orphans,
                malformed = self.malformed,
                "bulk stream contained records that could not be attached"
            );
        }
        debug!(?kind, lines = self.lines, roots = self.roots, attached = self.attached, "assembly complete");
    }
}

#[derive(Debug, Clone)]
pub struct Assembly<T> {
    pub roots: Vec<T>,
    pub report: AssemblyReport,
}

#[derive(Debug, Clone)]
pub enum Assembled {
    Products(Assembly<ProductNode>),
    Collections(Assembly<CollectionNode>),
}

pub fn assemble<S: AsRef<str>>(lines: &[S], kind: EntityKind) -> Assembled {
    match kind {
        EntityKind::Products => Assembled::Products(assemble_products(lines)),
        EntityKind::Collections => Assembled::Collections(assemble_collections(lines)),
    }
}

fn parse_records<S: AsRef<str>>(lines: &[S], report: &mut AssemblyReport) -> Vec<FlatRecord> {
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        report.lines += 1;
        match FlatRecord::parse(line) {
            Ok(rec) => out.push(rec),
            Err(err) => {
                report.malformed += 1;
                warn!(error = %err, "skipping malformed bulk line");
            }
        }
    }
    out
}

fn decode<T: for<'de> Deserialize<'de>>(rec: &FlatRecord, report: &mut AssemblyReport) -> Option<T> {
    match serde_json::from_value(rec.body.clone()) {
        Ok(v) => Some(v),
        Err(err) => {
            report.malformed += 1;
            warn!(id = %rec.id, kind = rec.kind.as_str(), error = %err, "record shape not recognised");
            None
        }
    }
}

pub fn assemble_products<S: AsRef<str>>(lines: &[S]) -> Assembly<ProductNode> {
    let mut report = AssemblyReport::default();
    let records = parse_records(lines, &mut report);

    // Pass 1: roots
    let mut roots: IndexMap<String, ProductNode> = IndexMap::new();
    for rec in records.iter().filter(|r| r.is_root()) {
        if roots.contains_key(&rec.id) {
            report.duplicate_roots += 1;
            continue;
        }
        if let Some(line) = decode::<ProductLine>(rec, &mut report) {
            roots.insert(rec.id.clone(), line.into_node());
        }
    }

    // Pass 2: direct children
    let mut deferred: Vec<&FlatRecord> = Vec::new();
    for rec in records.iter().filter(|r| !r.is_root()) {
        let parent = rec.parent_id.as_deref().unwrap_or_default();
        match rec.kind {
            RecordKind::Metafield => deferred.push(rec),
            RecordKind::Image | RecordKind::Variant | RecordKind::Collection => {
                let Some(root) = roots.get_mut(parent) else {
                    report.orphan(rec);
                    continue;
                };
                let attached = match rec.kind {
                    RecordKind::Image => decode::<ImageLine>(rec, &mut report)
                        .map(|l| root.images.push(l.into_image())),
                    RecordKind::Variant => decode::<VariantLine>(rec, &mut report)
                        .map(|l| root.variants.push(l.into_node())),
                    _ => decode::<CollectionRefLine>(rec, &mut report)
                        .map(|l| root.collections.push(l.into_ref())),
                };
                if attached.is_some() {
                    report.attached += 1;
                }
            }
            _ => report.orphan(rec),
        }
    }

    // Pass 3: grandchildren. Index every attached variant by identity.
    let mut variant_owner: HashMap<String, (usize, usize)> = HashMap::new();
    for (ri, (_, root)) in roots.iter().enumerate() {
        for (vi, variant) in root.variants.iter().enumerate() {
            variant_owner.insert(variant.id.clone(), (ri, vi));
        }
    }
    for rec in deferred {
        let parent = rec.parent_id.as_deref().unwrap_or_default();
        let slot = if let Some(&(ri, vi)) = variant_owner.get(parent) {
            roots
                .get_index_mut(ri)
                .and_then(|(_, root)| root.variants.get_mut(vi))
                .map(|v| &mut v.metafields)
        } else {
            roots.get_mut(parent).map(|root| &mut root.metafields)
        };
        let Some(slot) = slot else {
            report.orphan(rec);
            continue;
        };
        if let Some(mf) = decode::<MetafieldRecord>(rec, &mut report) {
            slot.push(mf);
            report.attached += 1;
        }
    }

    report.roots = roots.len();
    report.log(EntityKind::Products);
    Assembly {
        roots: roots.into_values().collect(),
        report,
    }
}

pub fn assemble_collections<S: AsRef<str>>(lines: &[S]) -> Assembly<CollectionNode> {
    let mut report = AssemblyReport::default();
    let records = parse_records(lines, &mut report);

    let mut roots: IndexMap<String, CollectionNode> = IndexMap::new();
    for rec in records.iter().filter(|r| r.is_root()) {
        if roots.contains_key(&rec.id) {
            report.duplicate_roots += 1;
            continue;
        }
        if let Some(line) = decode::<CollectionLine>(rec, &mut report) {
            roots.insert(rec.id.clone(), line.into_node());
        }
    }

    for rec in records.iter().filter(|r| !r.is_root()) {
        let parent = rec.parent_id.as_deref().unwrap_or_default();
        let Some(root) = roots.get_mut(parent) else {
            report.orphan(rec);
            continue;
        };
        match rec.kind {
            RecordKind::Product => {
                root.members.push(rec.id.clone());
                report.attached += 1;
            }
            RecordKind::Metafield => {
                if let Some(mf) = decode::<MetafieldRecord>(rec, &mut report) {
                    root.metafields.push(mf);
                    report.attached += 1;
                }
            }
            _ => report.orphan(rec),
        }
    }

    report.roots = roots.len();
    report.log(EntityKind::Collections);
    Assembly {
        roots: roots.into_values().collect(),
        report,
    }
}

// ---- wire shapes -----------------------------------------------------------

fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Money scalars arrive as strings, older payloads occasionally as numbers.
fn decimal_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductLine {
    id: String,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    description_html: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    options: Vec<ProductOption>,
}

impl ProductLine {
    fn into_node(self) -> ProductNode {
        ProductNode {
            id: self.id,
            title: self.title,
            status: self.status,
            description_html: self.description_html,
            tags: self.tags,
            options: self.options,
            images: Vec::new(),
            variants: Vec::new(),
            collections: Vec::new(),
            metafields: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageLine {
    id: String,
    #[serde(alias = "src", alias = "originalSrc")]
    url: String,
    #[serde(default)]
    alt_text: Option<String>,
}

impl ImageLine {
    fn into_image(self) -> SourceImage {
        SourceImage {
            id: self.id,
            url: self.url,
            alt: self.alt_text,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantLine {
    id: String,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default, deserialize_with = "decimal_string")]
    price: String,
    #[serde(default)]
    inventory_quantity: Option<i64>,
    #[serde(default, deserialize_with = "null_default")]
    selected_options: Vec<SelectedOption>,
}

impl VariantLine {
    fn into_node(self) -> VariantNode {
        VariantNode {
            id: self.id,
            title: self.title,
            sku: self.sku,
            price: self.price,
            inventory_quantity: self.inventory_quantity,
            selected_options: self.selected_options,
            metafields: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct CollectionRefLine {
    id: String,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
}

impl CollectionRefLine {
    fn into_ref(self) -> CollectionRef {
        CollectionRef {
            id: self.id,
            title: self.title,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionLine {
    id: String,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    description_html: Option<String>,
}

impl CollectionLine {
    fn into_node(self) -> CollectionNode {
        CollectionNode {
            id: self.id,
            title: self.title,
            handle: self.handle,
            description_html: self.description_html,
            members: Vec::new(),
            metafields: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn product_stream() -> Vec<String> {
        vec![
            r#"{"id":"gid://shopify/Product/1","title":"Lamp","status":"ACTIVE","options":[{"name":"Color","values":["Red","Blue"]}]}"#,
            r#"{"id":"gid://shopify/ProductImage/10","url":"https://cdn.example.com/lamp.jpg","altText":null,"__parentId":"gid://shopify/Product/1"}"#,
            r#"{"id":"gid://shopify/ProductVariant/11","title":"Red","sku":"L-R","price":"19.90","inventoryQuantity":3,"selectedOptions":[{"name":"Color","value":"Red"}],"__parentId":"gid://shopify/Product/1"}"#,
            r#"{"id":"gid://shopify/Metafield/12","namespace":"custom","key":"material","value":"steel","type":"single_line_text_field","__parentId":"gid://shopify/ProductVariant/11"}"#,
            r#"{"id":"gid://shopify/Metafield/13","namespace":"custom","key":"bx_code","value":"BX-1","__parentId":"gid://shopify/Product/1"}"#,
            r#"{"id":"gid://shopify/Collection/14","title":"Lighting","__parentId":"gid://shopify/Product/1"}"#,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn canonical(mut roots: Vec<ProductNode>) -> Vec<ProductNode> {
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        for r in &mut roots {
            r.images.sort_by(|a, b| a.id.cmp(&b.id));
            r.variants.sort_by(|a, b| a.id.cmp(&b.id));
            r.collections.sort_by(|a, b| a.id.cmp(&b.id));
            r.metafields.sort_by(|a, b| a.id.cmp(&b.id));
            for v in &mut r.variants {
                v.metafields.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
        roots
    }

    #[test]
    fn attaches_children_and_grandchildren() {
        let out = assemble_products(&product_stream());
        assert_eq!(out.roots.len(), 1);
        let p = &out.roots[0];
        assert_eq!(p.images.len(), 1);
        assert_eq!(p.variants.len(), 1);
        assert_eq!(p.variants[0].metafields[0].key, "material");
        assert_eq!(p.metafields[0].key, "bx_code");
        assert_eq!(p.collections[0].title, "Lighting");
        assert_eq!(out.report.attached, 5);
        assert_eq!(out.report.orphan_total(), 0);
    }

    #[test]
    fn assembly_is_independent_of_line_order() {
        let lines = product_stream();
        let expected = canonical(assemble_products(&lines).roots);
        for perm in lines.iter().cloned().permutations(lines.len()) {
            let got = canonical(assemble_products(&perm).roots);
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn orphans_are_dropped_and_counted() {
        let lines = vec![
            r#"{"id":"gid://shopify/Product/1","title":"Lamp"}"#,
            r#"{"id":"gid://shopify/ProductVariant/2","price":"1.00","__parentId":"gid://shopify/Product/404"}"#,
            r#"{"id":"gid://shopify/Metafield/3","key":"k","value":"v","__parentId":"gid://shopify/ProductVariant/404"}"#,
            "{broken",
        ];
        let out = assemble_products(&lines);
        assert_eq!(out.roots.len(), 1);
        assert!(out.roots[0].variants.is_empty());
        assert_eq!(out.report.orphans.get("variant"), Some(&1));
        assert_eq!(out.report.orphans.get("metafield"), Some(&1));
        assert_eq!(out.report.malformed, 1);
    }

    #[test]
    fn numeric_prices_are_kept_as_decimal_strings() {
        let lines = vec![
            r#"{"id":"gid://shopify/Product/1","title":"Lamp","tags":null}"#,
            r#"{"id":"gid://shopify/ProductVariant/2","price":12.5,"__parentId":"gid://shopify/Product/1"}"#,
        ];
        let out = assemble_products(&lines);
        assert_eq!(out.roots[0].variants[0].price, "12.5");
        assert!(out.roots[0].tags.is_empty());
    }

    #[test]
    fn collections_collect_member_products() {
        let lines = vec![
            r#"{"id":"gid://shopify/Product/5","__parentId":"gid://shopify/Collection/1"}"#,
            r#"{"id":"gid://shopify/Collection/1","title":"Lighting","handle":"lighting"}"#,
            r#"{"id":"gid://shopify/Product/6","__parentId":"gid://shopify/Collection/2"}"#,
        ];
        match assemble(&lines, EntityKind::Collections) {
            Assembled::Collections(out) => {
                assert_eq!(out.roots.len(), 1);
                assert_eq!(out.roots[0].members, vec!["gid://shopify/Product/5"]);
                assert_eq!(out.report.orphans.get("product"), Some(&1));
            }
            Assembled::Products(_) => panic!("wrong assembly kind"),
        }
    }
}
