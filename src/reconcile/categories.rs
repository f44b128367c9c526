//! Source collections -> destination categories.
//!
//! Handle (derived from the title) is the primary match; the external id in
//! metadata confirms or catches renamed handles.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use super::identity::IdentityCorrelation;
use crate::catalog::types::{short_id, SourceCollection};
use crate::destination::{CategoryCreate, DestCategory, Metadata};
use crate::normalization::title::handleize;

#[derive(Debug, Clone, Default)]
pub struct CategoryPlan {
    pub to_create: Vec<CategoryCreate>,
    /// Source collection id -> existing destination category id.
    pub matched: HashMap<String, String>,
    /// Collections whose handle collides with another planned create.
    pub skipped: Vec<String>,
}

pub fn category_handle(collection: &SourceCollection) -> String {
    derive_handle(&collection.title, collection.handle.as_deref(), &collection.id)
}

/// Handle from the title, else the source handle, else `collection-{id}`.
pub fn derive_handle(title: &str, source_handle: Option<&str>, id: &str) -> String {
    let from_title = handleize(title);
    if !from_title.is_empty() {
        return from_title;
    }
    let from_handle = source_handle.map(handleize).unwrap_or_default();
    if !from_handle.is_empty() {
        return from_handle;
    }
    format!("collection-{}", short_id(id))
}

pub fn plan_categories(
    source: &[SourceCollection],
    existing: &[DestCategory],
    identity: &dyn IdentityCorrelation,
) -> CategoryPlan {
    let by_handle: HashMap<&str, &DestCategory> =
        existing.iter().map(|c| (c.handle.as_str(), c)).collect();
    let mut by_external: HashMap<&str, &DestCategory> = HashMap::new();
    for c in existing {
        if let Some(key) = identity.category_key(c) {
            by_external.entry(key).or_insert(c);
        }
    }

    let mut plan = CategoryPlan::default();
    let mut planned_handles: HashSet<String> = HashSet::new();
    for collection in source {
        let handle = category_handle(collection);
        let hit = by_handle
            .get(handle.as_str())
            .or_else(|| by_external.get(collection.id.as_str()));
        if let Some(dest) = hit {
            debug!(source = %collection.id, dest = %dest.id, "category already present");
            plan.matched.insert(collection.id.clone(), dest.id.clone());
            continue;
        }
        if !planned_handles.insert(handle.clone()) {
            warn!(source = %collection.id, %handle, "handle collides with another new category; skipping");
            plan.skipped.push(collection.id.clone());
            continue;
        }
        let mut metadata = Metadata::new();
        identity.stamp(&mut metadata, &collection.id);
        plan.to_create.push(CategoryCreate {
            name: collection.title.clone(),
            handle,
            description: collection.description.clone(),
            is_active: true,
            metadata,
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::identity::MetadataCorrelation;
    use serde_json::json;

    fn collection(id: &str, title: &str) -> SourceCollection {
        SourceCollection {
            id: id.into(),
            title: title.into(),
            handle: None,
            description: None,
        }
    }

    fn dest(id: &str, handle: &str, external: Option<&str>) -> DestCategory {
        let mut metadata = Metadata::new();
        if let Some(e) = external {
            metadata.insert("external_id".into(), json!(e));
        }
        DestCategory {
            id: id.into(),
            name: handle.into(),
            handle: handle.into(),
            metadata,
        }
    }

    #[test]
    fn matches_by_handle_then_external_id() {
        let source = vec![
            collection("gid://shopify/Collection/1", "Home & Garden"),
            collection("gid://shopify/Collection/2", "Renamed Lights"),
            collection("gid://shopify/Collection/3", "New Arrivals"),
        ];
        let existing = vec![
            dest("pcat_a", "home-garden", None),
            dest("pcat_b", "lighting", Some("gid://shopify/Collection/2")),
        ];
        let plan = plan_categories(&source, &existing, &MetadataCorrelation);
        assert_eq!(plan.matched["gid://shopify/Collection/1"], "pcat_a");
        assert_eq!(plan.matched["gid://shopify/Collection/2"], "pcat_b");
        assert_eq!(plan.to_create.len(), 1);
        let created = &plan.to_create[0];
        assert_eq!(created.handle, "new-arrivals");
        assert!(created.is_active);
        assert_eq!(created.metadata["external_id"], json!("gid://shopify/Collection/3"));
    }

    #[test]
    fn colliding_handles_are_created_once() {
        let source = vec![
            collection("gid://shopify/Collection/1", "Sale!"),
            collection("gid://shopify/Collection/2", "Sale"),
        ];
        let plan = plan_categories(&source, &[], &MetadataCorrelation);
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.skipped, vec!["gid://shopify/Collection/2"]);
    }

    #[test]
    fn accented_title_matches_existing_folded_handle() {
        let mut lamps = collection("gid://shopify/Collection/4", "Lámparas de Mesa");
        lamps.handle = Some("lamparas-de-mesa".into());
        let existing = vec![dest("pcat_l", "lamparas-de-mesa", None)];
        let plan = plan_categories(&[lamps], &existing, &MetadataCorrelation);
        assert_eq!(plan.matched["gid://shopify/Collection/4"], "pcat_l");
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn handle_falls_back_when_title_has_no_ascii() {
        assert_eq!(
            category_handle(&collection("gid://shopify/Collection/9", "椅子")),
            "collection-9"
        );
    }
}
