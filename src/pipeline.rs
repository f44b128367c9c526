//! One sync run per selected kind: bulk export -> assemble -> normalize ->
//! relocate images -> reconcile. Stages run strictly in sequence.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::catalog::{assemble_collections, assemble_products, AssemblyReport};
use crate::destination::PgCatalogStore;
use crate::media::{
    AssetRelocator, HttpFetcher, ObjectStore, RelocationReport, RelocatorSettings, S3Store,
    StorageConfig,
};
use crate::normalization::{normalize_collections, normalize_products, NormalizeReport};
use crate::reconcile::{CategoryOutcome, MetadataCorrelation, ProductOutcome, Reconciler};
use crate::runs::{PgRunLog, RunLog, RunStatus};
use crate::shopify::{queries, BulkExporter, BulkSettings, ShopifyClient, ShopifyConfig};
use crate::util::db::Db;
use crate::util::env::{db_url, env_parse};
use crate::util::sleep::TokioSleeper;

/// Type selector accepted by the trigger surface. Orders categories first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Category,
    Product,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Category => "category",
            SyncKind::Product => "product",
        }
    }

    fn query(&self) -> &'static str {
        match self {
            SyncKind::Category => queries::COLLECTIONS_BULK,
            SyncKind::Product => queries::PRODUCTS_BULK,
        }
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(SyncKind::Product),
            "category" | "categories" | "collection" | "collections" => Ok(SyncKind::Category),
            other => Err(format!("unknown sync type `{other}`")),
        }
    }
}

/// Parse selectors, de-duplicated and ordered categories-first.
pub fn parse_kinds<S: AsRef<str>>(raw: &[S]) -> Result<Vec<SyncKind>, String> {
    let mut kinds = raw
        .iter()
        .map(|s| s.as_ref().parse::<SyncKind>())
        .collect::<Result<Vec<_>, _>>()?;
    if kinds.is_empty() {
        return Err("at least one sync type is required".into());
    }
    kinds.sort();
    kinds.dedup();
    Ok(kinds)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub kind: SyncKind,
    pub dry_run: bool,
    pub exported_lines: usize,
    pub assembly: AssemblyReport,
    pub normalize: NormalizeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relocation: Option<RelocationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<CategoryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<ProductOutcome>,
}

impl RunSummary {
    fn new(kind: SyncKind, dry_run: bool, lines: usize) -> Self {
        Self {
            kind,
            dry_run,
            exported_lines: lines,
            assembly: AssemblyReport::default(),
            normalize: NormalizeReport::default(),
            relocation: None,
            categories: None,
            products: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    pub kind: SyncKind,
    pub status: RunStatus,
    pub error: Option<String>,
}

pub struct Syncer {
    exporter: BulkExporter,
    relocator: AssetRelocator,
    reconciler: Reconciler,
    runs: Arc<dyn RunLog>,
    dry_run: bool,
    active: Mutex<()>,
}

impl Syncer {
    pub fn new(
        exporter: BulkExporter,
        relocator: AssetRelocator,
        reconciler: Reconciler,
        runs: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            exporter,
            relocator,
            reconciler,
            runs,
            dry_run: false,
            active: Mutex::new(()),
        }
    }

    /// Plan only: no destination writes and no image uploads.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self.reconciler = self.reconciler.dry_run(on);
        self
    }

    pub fn runs(&self) -> Arc<dyn RunLog> {
        self.runs.clone()
    }

    /// Wire the production collaborators from the environment.
    pub async fn from_env(db: Db) -> Result<Self> {
        let exporter = exporter_from_env()?;
        let sleeper = Arc::new(TokioSleeper);

        let storage = match StorageConfig::from_env() {
            Some(cfg) => Some(Arc::new(S3Store::new(cfg)?) as Arc<dyn ObjectStore>),
            None => {
                warn!("MEDIA_S3_* not set; images keep their source URLs");
                None
            }
        };
        let fetcher = HttpFetcher::new().context("building image fetcher")?;
        let relocator = AssetRelocator::new(
            storage,
            Arc::new(fetcher),
            sleeper,
            RelocatorSettings::from_env(),
        );

        let store = Arc::new(PgCatalogStore::new(db.clone()));
        let reconciler = Reconciler::new(store, Arc::new(MetadataCorrelation));
        Ok(Self::new(exporter, relocator, reconciler, Arc::new(PgRunLog::new(db))))
    }

    /// Database from `DATABASE_URL` (or its fallbacks) and `DB_MAX_CONNS`.
    pub async fn connect_db() -> Result<Db> {
        let url = db_url()?;
        Db::connect(&url, env_parse("DB_MAX_CONNS", 5u32)).await
    }

    /// Run every selected kind, categories before products, recording each
    /// run. Refuses to start while another trigger is still running.
    pub async fn trigger(&self, kinds: &[SyncKind]) -> Result<Vec<TriggerResult>> {
        let mut ordered = kinds.to_vec();
        ordered.sort();
        ordered.dedup();

        let Ok(_active) = self.active.try_lock() else {
            warn!(kinds = ?ordered, "a sync is already running; trigger skipped");
            let mut results = Vec::with_capacity(ordered.len());
            for kind in ordered {
                let id = self.runs.start(kind.as_str()).await?;
                let reason = "another sync run is in progress".to_string();
                self.runs
                    .finish(id, RunStatus::Skipped, None, Some(reason.clone()))
                    .await?;
                results.push(TriggerResult {
                    kind,
                    status: RunStatus::Skipped,
                    error: Some(reason),
                });
            }
            return Ok(results);
        };

        let mut results = Vec::with_capacity(ordered.len());
        for kind in ordered {
            let id = self.runs.start(kind.as_str()).await?;
            match self.run(kind).await {
                Ok(summary) => {
                    let summary = serde_json::to_value(&summary).context("serialising run summary")?;
                    self.runs
                        .finish(id, RunStatus::Succeeded, Some(summary), None)
                        .await?;
                    results.push(TriggerResult {
                        kind,
                        status: RunStatus::Succeeded,
                        error: None,
                    });
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(kind = kind.as_str(), error = %message, "sync run failed");
                    self.runs
                        .finish(id, RunStatus::Failed, None, Some(message.clone()))
                        .await?;
                    results.push(TriggerResult {
                        kind,
                        status: RunStatus::Failed,
                        error: Some(message),
                    });
                }
            }
        }
        Ok(results)
    }

    /// One run without run-log bookkeeping.
    #[instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn run(&self, kind: SyncKind) -> Result<RunSummary> {
        let lines = self
            .exporter
            .run(kind.query())
            .await
            .with_context(|| format!("bulk export of {} data", kind.as_str()))?;
        let mut summary = RunSummary::new(kind, self.dry_run, lines.len());

        match kind {
            SyncKind::Category => {
                let assembly = assemble_collections(&lines);
                let (collections, report) = normalize_collections(assembly.roots);
                summary.assembly = assembly.report;
                summary.normalize = report;
                let outcome = self
                    .reconciler
                    .sync_categories(&collections)
                    .await
                    .context("reconciling categories")?;
                summary.categories = Some(outcome);
            }
            SyncKind::Product => {
                let assembly = assemble_products(&lines);
                let (mut products, report) = normalize_products(assembly.roots);
                summary.assembly = assembly.report;
                summary.normalize = report;
                if self.relocator.is_enabled() && !self.dry_run {
                    summary.relocation = Some(self.relocator.relocate_products(&mut products).await);
                }
                let outcome = self
                    .reconciler
                    .sync_products(&products)
                    .await
                    .context("reconciling products")?;
                summary.products = Some(outcome);
            }
        }
        info!(
            kind = kind.as_str(),
            lines = summary.exported_lines,
            orphans = summary.assembly.orphan_total(),
            removed = summary.normalize.removed_products.len() + summary.normalize.removed_collections.len(),
            cleared_skus = summary.normalize.cleared_skus.len(),
            "sync run finished"
        );
        Ok(summary)
    }
}

/// Bulk exporter wired from `SHOPIFY_*` settings alone.
pub fn exporter_from_env() -> Result<BulkExporter> {
    let cfg = ShopifyConfig::from_env()?;
    let settings = BulkSettings::from(&cfg);
    let client = ShopifyClient::new(cfg)?;
    Ok(BulkExporter::new(Arc::new(client), Arc::new(TokioSleeper), settings))
}

/// Assembled and normalized catalog of one kind, with both reports, as JSON.
pub async fn export_catalog(exporter: &BulkExporter, kind: SyncKind) -> Result<Value> {
    let lines = exporter.run(kind.query()).await?;
    Ok(match kind {
        SyncKind::Category => {
            let assembly = assemble_collections(&lines);
            let (items, report) = normalize_collections(assembly.roots);
            json!({ "assembly": assembly.report, "normalize": report, "items": items })
        }
        SyncKind::Product => {
            let assembly = assemble_products(&lines);
            let (items, report) = normalize_products(assembly.roots);
            json!({ "assembly": assembly.report, "normalize": report, "items": items })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{MemoryCatalogStore, StoreContext};
    use crate::error::BulkError;
    use crate::media::relocate::{Downloaded, FetchError, Fetcher};
    use crate::media::storage::testing::MemoryObjectStore;
    use crate::runs::MemoryRunLog;
    use crate::shopify::bulk::testing::{op, ScriptedApi};
    use crate::util::sleep::testing::RecordingSleeper;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Serves a tiny PNG for every URL.
    struct PngFetcher;

    #[async_trait]
    impl Fetcher for PngFetcher {
        async fn fetch(&self, _url: &str) -> Result<Downloaded, FetchError> {
            Ok(Downloaded {
                bytes: Bytes::from_static(b"png"),
                content_type: Some("image/png".into()),
            })
        }
    }

    const RESULT_URL: &str = "https://storage.example.com/bulk.jsonl";

    fn syncer(
        api: ScriptedApi,
        store: Arc<MemoryCatalogStore>,
        runs: Arc<MemoryRunLog>,
        objects: Option<Arc<MemoryObjectStore>>,
    ) -> Syncer {
        let sleeper = Arc::new(RecordingSleeper::default());
        let exporter = BulkExporter::new(Arc::new(api), sleeper.clone(), BulkSettings::default());
        let relocator = AssetRelocator::new(
            objects.map(|o| o as Arc<dyn ObjectStore>),
            Arc::new(PngFetcher),
            sleeper,
            RelocatorSettings::default(),
        );
        let reconciler = Reconciler::new(store, Arc::new(MetadataCorrelation));
        Syncer::new(exporter, relocator, reconciler, runs)
    }

    fn completed_export(body: &str) -> ScriptedApi {
        ScriptedApi::new(
            vec![Value::Null, op(2, "COMPLETED", None, Some(RESULT_URL))],
            body,
        )
    }

    fn store() -> Arc<MemoryCatalogStore> {
        Arc::new(MemoryCatalogStore::new(StoreContext {
            supported_currencies: vec!["eur".into()],
            default_sales_channel_id: None,
        }))
    }

    #[test]
    fn selectors_parse_with_collection_alias() {
        assert_eq!(
            parse_kinds(&["product", "collection", "category"]).unwrap(),
            vec![SyncKind::Category, SyncKind::Product]
        );
        assert!(parse_kinds(&["orders"]).is_err());
        assert!(parse_kinds::<&str>(&[]).is_err());
        assert_eq!(parse_kinds(&["Products"]).unwrap(), vec![SyncKind::Product]);
    }

    #[tokio::test]
    async fn duplicate_titles_keep_the_first_product() {
        let body = [
            r#"{"id":"gid://1","title":"Lamp","status":"ACTIVE"}"#,
            r#"{"id":"gid://2","title":"Lamp","status":"ACTIVE"}"#,
        ]
        .join("\n");
        let store = store();
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(completed_export(&body), store.clone(), runs, None);

        let summary = sync.run(SyncKind::Product).await.unwrap();
        assert_eq!(summary.normalize.removed_products.len(), 1);
        assert_eq!(summary.normalize.removed_products[0].id, "gid://2");
        let stored = store.products();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].external_id.as_deref(), Some("1"));
        assert_eq!(summary.products.map(|p| p.planned_creates), Some(1));
    }

    #[tokio::test]
    async fn failed_bulk_run_surfaces_code_and_writes_nothing() {
        let api = ScriptedApi::new(
            vec![
                Value::Null,
                op(2, "FAILED", Some("INTERNAL_SERVER_ERROR"), None),
            ],
            "",
        );
        let store = store();
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(api, store.clone(), runs.clone(), None);

        let err = sync.run(SyncKind::Product).await.unwrap_err();
        let bulk = err.downcast_ref::<BulkError>().unwrap();
        assert_eq!(bulk.code(), Some("INTERNAL_SERVER_ERROR"));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn trigger_records_failed_run() {
        let api = ScriptedApi::new(
            vec![
                Value::Null,
                op(2, "FAILED", Some("INTERNAL_SERVER_ERROR"), None),
            ],
            "",
        );
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(api, store(), runs.clone(), None);

        let results = sync.trigger(&[SyncKind::Product]).await.unwrap();
        assert_eq!(results[0].status, RunStatus::Failed);
        let (records, count) = runs.list(10).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(records[0].status, RunStatus::Failed);
        assert!(records[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("INTERNAL_SERVER_ERROR"));
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(completed_export(""), store(), runs.clone(), None);
        let _held = sync.active.lock().await;

        let results = sync.trigger(&[SyncKind::Category]).await.unwrap();
        assert_eq!(results[0].status, RunStatus::Skipped);
        let (records, _) = runs.list(10).await.unwrap();
        assert_eq!(records[0].status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn product_images_are_relocated_before_writing() {
        let body = [
            r#"{"id":"gid://shopify/Product/1","title":"Lamp"}"#,
            r#"{"id":"gid://shopify/ProductImage/5","src":"https://cdn.shopify.com/s/lamp.png","__parentId":"gid://shopify/Product/1"}"#,
            r#"{"id":"gid://shopify/ProductVariant/9","title":"Default","sku":"L-1","price":"5.00","__parentId":"gid://shopify/Product/1"}"#,
        ]
        .join("\n");
        let objects = Arc::new(MemoryObjectStore::default());
        let store = store();
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(completed_export(&body), store.clone(), runs, Some(objects.clone()));

        let summary = sync.run(SyncKind::Product).await.unwrap();
        assert_eq!(summary.relocation.map(|r| r.relocated), Some(1));
        assert_eq!(objects.keys().len(), 1);
        let product = &store.products()[0];
        assert_eq!(product.variants[0].sku.as_deref(), Some("L-1"));
        assert_eq!(product.external_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn dry_run_skips_uploads_and_writes() {
        let body = r#"{"id":"gid://shopify/Product/1","title":"Lamp"}"#;
        let objects = Arc::new(MemoryObjectStore::default());
        let store = store();
        let runs = Arc::new(MemoryRunLog::default());
        let sync = syncer(completed_export(body), store.clone(), runs, Some(objects.clone()))
            .dry_run(true);

        let summary = sync.run(SyncKind::Product).await.unwrap();
        assert!(summary.dry_run);
        assert!(summary.relocation.is_none());
        assert_eq!(summary.products.map(|p| p.planned_creates), Some(1));
        assert_eq!(store.write_count(), 0);
    }
}
