use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use super::{
    new_id, CatalogStore, CategoryCreate, CategoryFilter, DestCategory, DestProduct, DestVariant,
    Page, ProductFilter, ProductInput, StoreContext, WriteFailure, WriteReport,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    categories: Vec<DestCategory>,
    products: Vec<DestProduct>,
    writes: usize,
}

/// In-memory destination for tests and local experiments.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    context: StoreContext,
    state: Mutex<State>,
    /// Titles whose writes fail, to exercise per-item failure handling.
    reject_titles: HashSet<String>,
}

impl MemoryCatalogStore {
    pub fn new(context: StoreContext) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    pub fn rejecting(mut self, title: &str) -> Self {
        self.reject_titles.insert(title.to_string());
        self
    }

    pub fn with_categories(self, categories: Vec<DestCategory>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.categories = categories;
        }
        self
    }

    /// Drop a category and, as the relational store does, every link to it.
    pub fn delete_category(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.categories.retain(|c| c.id != id);
            for p in state.products.iter_mut() {
                p.category_ids.retain(|c| c != id);
            }
        }
    }

    /// Rewrite a product's links without validation, to model stale reads.
    pub fn force_links(&self, product_id: &str, category_ids: Vec<String>) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(p) = state.products.iter_mut().find(|p| p.id == product_id) {
                p.category_ids = category_ids;
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Write("memory store poisoned".into()))
    }

    /// Successful item writes so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }

    pub fn products(&self) -> Vec<DestProduct> {
        self.state
            .lock()
            .map(|s| s.products.clone())
            .unwrap_or_default()
    }

    pub fn categories(&self) -> Vec<DestCategory> {
        self.state
            .lock()
            .map(|s| s.categories.clone())
            .unwrap_or_default()
    }
}

fn paginate<T: Clone>(matched: Vec<T>, skip: usize, take: Option<usize>) -> Page<T> {
    let count = matched.len();
    let items = matched
        .into_iter()
        .skip(skip)
        .take(take.unwrap_or(usize::MAX))
        .collect();
    Page { items, count }
}

/// Links whose category still exists; dangling ids are dropped.
fn live_links(categories: &[DestCategory], ids: &[String]) -> Vec<String> {
    ids.iter()
        .filter(|id| categories.iter().any(|c| &c.id == *id))
        .cloned()
        .collect()
}

fn to_dest_variants(input: &ProductInput, existing: &[DestVariant]) -> Vec<DestVariant> {
    let mut out: Vec<DestVariant> = existing.to_vec();
    for v in &input.variants {
        let variant = DestVariant {
            id: v.id.clone().unwrap_or_else(|| new_id("variant")),
            title: v.title.clone(),
            sku: v.sku.clone(),
            prices: v.prices.clone(),
            metadata: v.metadata.clone(),
        };
        match out.iter_mut().find(|e| e.id == variant.id) {
            Some(slot) => *slot = variant,
            None => out.push(variant),
        }
    }
    out
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn store_context(&self) -> Result<StoreContext, StoreError> {
        Ok(self.context.clone())
    }

    async fn find_categories(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Page<DestCategory>, StoreError> {
        let state = self.lock()?;
        let matched: Vec<DestCategory> = state
            .categories
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        Ok(paginate(matched, filter.skip, filter.take))
    }

    async fn find_products(&self, filter: &ProductFilter) -> Result<Page<DestProduct>, StoreError> {
        let state = self.lock()?;
        let matched: Vec<DestProduct> = state
            .products
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        Ok(paginate(matched, filter.skip, filter.take))
    }

    async fn create_categories(&self, batch: &[CategoryCreate]) -> Result<WriteReport, StoreError> {
        let mut state = self.lock()?;
        let mut report = WriteReport::default();
        for c in batch {
            if self.reject_titles.contains(&c.name)
                || state.categories.iter().any(|e| e.handle == c.handle)
            {
                report.failed.push(WriteFailure {
                    key: c.handle.clone(),
                    message: "rejected".into(),
                });
                continue;
            }
            let id = new_id("pcat");
            state.categories.push(DestCategory {
                id: id.clone(),
                name: c.name.clone(),
                handle: c.handle.clone(),
                metadata: c.metadata.clone(),
            });
            state.writes += 1;
            report.written.push(id);
        }
        Ok(report)
    }

    async fn create_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError> {
        let mut state = self.lock()?;
        let mut report = WriteReport::default();
        for p in batch {
            if self.reject_titles.contains(&p.title) {
                report.failed.push(WriteFailure {
                    key: p.external_id.clone(),
                    message: "rejected".into(),
                });
                continue;
            }
            let id = new_id("prod");
            let links = live_links(&state.categories, &p.category_ids);
            state.products.push(DestProduct {
                id: id.clone(),
                external_id: Some(p.external_id.clone()),
                title: p.title.clone(),
                status: p.status,
                metadata: p.metadata.clone(),
                variants: to_dest_variants(p, &[]),
                category_ids: links,
            });
            state.writes += 1;
            report.written.push(id);
        }
        Ok(report)
    }

    async fn update_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError> {
        let mut state = self.lock()?;
        let mut report = WriteReport::default();
        for p in batch {
            let key = p.id.clone().unwrap_or_else(|| p.external_id.clone());
            let slot = p
                .id
                .as_deref()
                .and_then(|id| state.products.iter().position(|e| e.id == id));
            let Some(index) = slot.filter(|_| !self.reject_titles.contains(&p.title)) else {
                report.failed.push(WriteFailure {
                    key,
                    message: "no such product".into(),
                });
                continue;
            };
            let links = live_links(&state.categories, &p.category_ids);
            let existing = &mut state.products[index];
            existing.title = p.title.clone();
            existing.status = p.status;
            existing.external_id = Some(p.external_id.clone());
            existing.metadata = p.metadata.clone();
            existing.variants = to_dest_variants(p, &existing.variants);
            existing.category_ids = links;
            state.writes += 1;
            report.written.push(key);
        }
        Ok(report)
    }
}
