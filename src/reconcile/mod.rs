//! Reconciliation engine: plan create/update sets against the destination and
//! hand them to the [`CatalogStore`] write operations.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::catalog::types::{short_id, SourceCollection, SourceProduct};
use crate::destination::{
    CatalogStore, CategoryFilter, DestCategory, DestProduct, ProductFilter, WriteReport,
};
use crate::error::StoreError;

pub mod categories;
pub mod identity;
pub mod products;

pub use categories::{plan_categories, CategoryPlan};
pub use identity::{IdentityCorrelation, MetadataCorrelation, EXTERNAL_ID_KEY};
pub use products::{plan_products, ProductPlan};

/// Page size for destination queries and the chunk size for id lists.
pub const PAGE_SIZE: usize = 500;
const WRITE_BATCH: usize = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryOutcome {
    pub matched: usize,
    pub planned_creates: usize,
    pub skipped: usize,
    pub created: WriteReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductOutcome {
    pub planned_creates: usize,
    pub planned_updates: usize,
    pub unresolved_categories: usize,
    pub created: WriteReport,
    pub updated: WriteReport,
}

impl ProductOutcome {
    pub fn failed(&self) -> usize {
        self.created.failed.len() + self.updated.failed.len()
    }
}

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    identity: Arc<dyn IdentityCorrelation>,
    dry_run: bool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>, identity: Arc<dyn IdentityCorrelation>) -> Self {
        Self {
            store,
            identity,
            dry_run: false,
        }
    }

    /// Plan against the destination but skip every write.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    #[instrument(skip_all, fields(collections = source.len(), dry_run = self.dry_run))]
    pub async fn sync_categories(
        &self,
        source: &[SourceCollection],
    ) -> Result<CategoryOutcome, StoreError> {
        let keys: Vec<(String, String)> = source
            .iter()
            .map(|c| (c.id.clone(), categories::category_handle(c)))
            .collect();
        let existing = self.lookup_categories(&keys).await?;
        let plan = plan_categories(source, &existing, self.identity.as_ref());

        let mut outcome = CategoryOutcome {
            matched: plan.matched.len(),
            planned_creates: plan.to_create.len(),
            skipped: plan.skipped.len(),
            ..CategoryOutcome::default()
        };
        info!(
            matched = outcome.matched,
            to_create = outcome.planned_creates,
            skipped = outcome.skipped,
            "category plan ready"
        );
        if self.dry_run {
            return Ok(outcome);
        }
        for batch in plan.to_create.chunks(WRITE_BATCH) {
            outcome.created.merge(self.store.create_categories(batch).await?);
        }
        log_failures("category", &outcome.created);
        Ok(outcome)
    }

    #[instrument(skip_all, fields(products = source.len(), dry_run = self.dry_run))]
    pub async fn sync_products(
        &self,
        source: &[SourceProduct],
    ) -> Result<ProductOutcome, StoreError> {
        let ctx = self.store.store_context().await?;
        if ctx.supported_currencies.is_empty() {
            warn!("destination store has no supported currencies; new variants get no prices");
        }
        let category_map = self.category_map(source).await?;

        let external_ids: Vec<String> = source
            .iter()
            .map(|p| short_id(&p.id).to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut existing: Vec<DestProduct> = Vec::new();
        for chunk in external_ids.chunks(PAGE_SIZE) {
            let filter = self.identity.product_filter(chunk.to_vec());
            existing.extend(fetch_products(self.store.as_ref(), filter).await?);
        }

        let plan = plan_products(source, &existing, &category_map, &ctx, self.identity.as_ref());
        let mut outcome = ProductOutcome {
            planned_creates: plan.to_create.len(),
            planned_updates: plan.to_update.len(),
            unresolved_categories: plan.unresolved_categories,
            ..ProductOutcome::default()
        };
        info!(
            to_create = outcome.planned_creates,
            to_update = outcome.planned_updates,
            unresolved_categories = outcome.unresolved_categories,
            "product plan ready"
        );
        if self.dry_run {
            return Ok(outcome);
        }
        for batch in plan.to_create.chunks(WRITE_BATCH) {
            outcome.created.merge(self.store.create_products(batch).await?);
        }
        for batch in plan.to_update.chunks(WRITE_BATCH) {
            outcome.updated.merge(self.store.update_products(batch).await?);
        }
        log_failures("product create", &outcome.created);
        log_failures("product update", &outcome.updated);
        Ok(outcome)
    }

    /// Source collection id -> destination category id for every collection
    /// the products reference.
    async fn category_map(
        &self,
        source: &[SourceProduct],
    ) -> Result<HashMap<String, String>, StoreError> {
        let mut refs: HashMap<String, String> = HashMap::new();
        for product in source {
            for col in &product.collections {
                refs.entry(col.id.clone())
                    .or_insert_with(|| categories::derive_handle(&col.title, None, &col.id));
            }
        }
        if refs.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<(String, String)> = refs.into_iter().collect();
        let found = self.lookup_categories(&keys).await?;

        let mut by_external: HashMap<&str, &DestCategory> = HashMap::new();
        for c in &found {
            if let Some(key) = self.identity.category_key(c) {
                by_external.entry(key).or_insert(c);
            }
        }
        let by_handle: HashMap<&str, &DestCategory> =
            found.iter().map(|c| (c.handle.as_str(), c)).collect();

        Ok(keys
            .iter()
            .filter_map(|(id, handle)| {
                by_external
                    .get(id.as_str())
                    .or_else(|| by_handle.get(handle.as_str()))
                    .map(|c| (id.clone(), c.id.clone()))
            })
            .collect())
    }

    /// Categories matching any of the `(external id, handle)` pairs.
    async fn lookup_categories(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<DestCategory>, StoreError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for chunk in keys.chunks(PAGE_SIZE) {
            let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
            let mut filter = self.identity.category_filter(ids);
            filter.handles = Some(chunk.iter().map(|(_, h)| h.clone()).collect());
            for c in fetch_categories(self.store.as_ref(), filter).await? {
                if seen.insert(c.id.clone()) {
                    out.push(c);
                }
            }
        }
        Ok(out)
    }
}

fn log_failures(what: &str, report: &WriteReport) {
    for f in &report.failed {
        warn!(key = %f.key, error = %f.message, "{what} write failed");
    }
}

/// Walk every page of a category query.
pub async fn fetch_categories(
    store: &dyn CatalogStore,
    mut filter: CategoryFilter,
) -> Result<Vec<DestCategory>, StoreError> {
    filter.skip = 0;
    filter.take = Some(PAGE_SIZE);
    let mut out = Vec::new();
    loop {
        let page = store.find_categories(&filter).await?;
        let n = page.items.len();
        out.extend(page.items);
        filter.skip += n;
        if n == 0 || filter.skip >= page.count {
            return Ok(out);
        }
    }
}

/// Walk every page of a product query.
pub async fn fetch_products(
    store: &dyn CatalogStore,
    mut filter: ProductFilter,
) -> Result<Vec<DestProduct>, StoreError> {
    filter.skip = 0;
    filter.take = Some(PAGE_SIZE);
    let mut out = Vec::new();
    loop {
        let page = store.find_products(&filter).await?;
        let n = page.items.len();
        out.extend(page.items);
        filter.skip += n;
        if n == 0 || filter.skip >= page.count {
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{CollectionRef, SourceStatus, SourceVariant};
    use crate::destination::{MemoryCatalogStore, StoreContext};
    use crate::normalization::dedupe::dedupe_products;

    fn store() -> Arc<MemoryCatalogStore> {
        Arc::new(MemoryCatalogStore::new(StoreContext {
            supported_currencies: vec!["eur".into()],
            default_sales_channel_id: Some("sc_1".into()),
        }))
    }

    fn collection(n: u32, title: &str) -> SourceCollection {
        SourceCollection {
            id: format!("gid://shopify/Collection/{n}"),
            title: title.into(),
            handle: None,
            description: None,
        }
    }

    fn product(n: u32, title: &str, cols: &[(u32, &str)]) -> SourceProduct {
        SourceProduct {
            id: format!("gid://shopify/Product/{n}"),
            title: title.into(),
            status: SourceStatus::Active,
            description: None,
            options: vec![],
            tags: vec![],
            metafields: Default::default(),
            images: vec![],
            variants: vec![SourceVariant {
                id: format!("gid://shopify/ProductVariant/{n}"),
                title: "Default".into(),
                sku: Some(format!("SKU-{n}")),
                price: "10.00".into(),
                inventory_quantity: None,
                selected_options: vec![],
                metafields: Default::default(),
            }],
            collections: cols
                .iter()
                .map(|(c, t)| CollectionRef {
                    id: format!("gid://shopify/Collection/{c}"),
                    title: (*t).into(),
                })
                .collect(),
        }
    }

    fn variant(n: u32, sku: Option<&str>) -> SourceVariant {
        SourceVariant {
            id: format!("gid://shopify/ProductVariant/{n}"),
            title: format!("V{n}"),
            sku: sku.map(str::to_string),
            price: "10.00".into(),
            inventory_quantity: None,
            selected_options: vec![],
            metafields: Default::default(),
        }
    }

    fn reconciler(store: &Arc<MemoryCatalogStore>) -> Reconciler {
        Reconciler::new(store.clone(), Arc::new(MetadataCorrelation))
    }

    #[tokio::test]
    async fn categories_then_products_link_and_rerun_updates() {
        let store = store();
        let rec = reconciler(&store);

        let cats = rec
            .sync_categories(&[collection(1, "Lighting"), collection(2, "Garden")])
            .await
            .unwrap();
        assert_eq!(cats.created.written.len(), 2);

        let source = vec![product(10, "Lamp", &[(1, "Lighting")])];
        let first = rec.sync_products(&source).await.unwrap();
        assert_eq!(first.created.written.len(), 1);
        assert_eq!(first.unresolved_categories, 0);

        let again = rec.sync_categories(&[collection(1, "Lighting")]).await.unwrap();
        assert_eq!(again.matched, 1);
        assert_eq!(again.planned_creates, 0);

        // Second category assignment is added on top of the first.
        let source = vec![product(10, "Lamp", &[(2, "Garden")])];
        let second = rec.sync_products(&source).await.unwrap();
        assert_eq!(second.planned_creates, 0);
        assert_eq!(second.updated.written.len(), 1);
        let stored = store.products();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].category_ids.len(), 2);
    }

    #[tokio::test]
    async fn one_rejected_product_does_not_block_the_rest() {
        let store = Arc::new(
            MemoryCatalogStore::new(StoreContext::default()).rejecting("Broken"),
        );
        let rec = reconciler(&store);
        let out = rec
            .sync_products(&[product(1, "Broken", &[]), product(2, "Fine", &[])])
            .await
            .unwrap();
        assert_eq!(out.created.written.len(), 1);
        assert_eq!(out.failed(), 1);
        assert_eq!(store.products()[0].title, "Fine");
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let store = store();
        let rec = reconciler(&store).dry_run(true);
        let cats = rec.sync_categories(&[collection(1, "Lighting")]).await.unwrap();
        let prods = rec.sync_products(&[product(1, "Lamp", &[(1, "Lighting")])]).await.unwrap();
        assert_eq!(cats.planned_creates, 1);
        assert_eq!(prods.planned_creates, 1);
        assert_eq!(prods.unresolved_categories, 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn paging_walks_past_the_first_page() {
        let store = store();
        let rec = reconciler(&store);
        let source: Vec<SourceProduct> = (0..(PAGE_SIZE as u32 + 3))
            .map(|n| product(n, &format!("P{n}"), &[]))
            .collect();
        rec.sync_products(&source).await.unwrap();
        let all = fetch_products(store.as_ref(), ProductFilter::default()).await.unwrap();
        assert_eq!(all.len(), PAGE_SIZE + 3);
    }

    #[tokio::test]
    async fn reruns_keep_variant_count_when_skus_are_missing() {
        let store = store();
        let rec = reconciler(&store);
        let mut lamp = product(1, "Lamp", &[]);
        lamp.variants = vec![variant(11, Some("S")), variant(12, Some("S")), variant(13, None)];
        let (source, _) = dedupe_products(vec![lamp]);

        for _ in 0..3 {
            let out = rec.sync_products(&source).await.unwrap();
            assert_eq!(out.failed(), 0);
        }
        let stored = store.products();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].variants.len(), 3);
        let with_sku = stored[0].variants.iter().filter(|v| v.sku.is_some()).count();
        assert_eq!(with_sku, 1);
    }

    #[tokio::test]
    async fn links_to_deleted_categories_are_dropped_on_update() {
        let store = store();
        let rec = reconciler(&store);
        rec.sync_categories(&[collection(1, "Lighting"), collection(2, "Garden")])
            .await
            .unwrap();
        let source = vec![product(10, "Lamp", &[(1, "Lighting")])];
        rec.sync_products(&source).await.unwrap();

        let lamp = store.products()[0].clone();
        let garden = store
            .categories()
            .into_iter()
            .find(|c| c.handle == "garden")
            .unwrap();
        store.delete_category(&garden.id);
        // Stale link to the deleted category, as a read taken before the delete shows.
        let mut links = lamp.category_ids.clone();
        links.push(garden.id.clone());
        store.force_links(&lamp.id, links);

        let out = rec.sync_products(&source).await.unwrap();
        assert_eq!(out.failed(), 0);
        assert_eq!(out.updated.written.len(), 1);
        assert_eq!(store.products()[0].category_ids, lamp.category_ids);
    }
}
