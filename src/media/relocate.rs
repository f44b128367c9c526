//! Asset relocator: re-hosts product images in durable storage.
//!
//! Never fatal to a run. A failed image keeps its original URL.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::storage::ObjectStore;
use crate::catalog::types::SourceProduct;
use crate::error::AssetError;
use crate::util::env::env_parse;
use crate::util::sleep::Sleeper;

#[derive(Debug, Clone)]
pub struct RelocatorSettings {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub backoff_cap: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub prefix: String,
}

impl Default for RelocatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(5000),
            batch_size: 5,
            batch_pause: Duration::from_millis(1000),
            prefix: "products".to_string(),
        }
    }
}

impl RelocatorSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("MEDIA_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff_step: Duration::from_millis(env_parse("MEDIA_BACKOFF_MS", 1000u64)),
            backoff_cap: Duration::from_millis(env_parse("MEDIA_BACKOFF_CAP_MS", 5000u64)),
            batch_size: env_parse("MEDIA_BATCH_SIZE", d.batch_size).max(1),
            batch_pause: Duration::from_millis(env_parse("MEDIA_BATCH_PAUSE_MS", 1000u64)),
            prefix: env_parse("MEDIA_S3_PREFIX", d.prefix),
        }
    }

    /// Linear in the attempt number, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff_step * attempt).min(self.backoff_cap)
    }
}

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS, connect, reset or timeout.
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Downloaded, FetchError>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Other(err.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Downloaded, FetchError> {
        let resp = self.http.get(url).send().await.map_err(classify_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Other(format!("status {status}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(classify_reqwest)?;
        Ok(Downloaded {
            bytes,
            content_type,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelocationReport {
    pub images: usize,
    pub relocated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RelocationReport {
    fn add(&mut self, other: &RelocationReport) {
        self.images += other.images;
        self.relocated += other.relocated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct AssetRelocator {
    store: Option<Arc<dyn ObjectStore>>,
    fetcher: Arc<dyn Fetcher>,
    sleeper: Arc<dyn Sleeper>,
    settings: RelocatorSettings,
}

impl AssetRelocator {
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        fetcher: Arc<dyn Fetcher>,
        sleeper: Arc<dyn Sleeper>,
        settings: RelocatorSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            sleeper,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Re-host one image. `Ok(None)` means the caller keeps the original URL
    /// (storage not configured, or the resource is not an image).
    #[instrument(skip(self, owner_label))]
    pub async fn relocate(
        &self,
        url: &str,
        owner_id: &str,
        owner_label: &str,
    ) -> Result<Option<String>, AssetError> {
        let Some(store) = &self.store else {
            warn!("durable storage not configured; keeping original image url");
            return Ok(None);
        };
        let key = object_key(&self.settings.prefix, url);

        match store.exists(&key).await {
            Ok(true) => {
                debug!(%key, "object already stored");
                return Ok(Some(store.public_url(&key)));
            }
            Ok(false) => {}
            Err(err) => warn!(%key, error = %err, "existence check failed; uploading anyway"),
        }

        let downloaded = match self.download(url).await {
            Ok(d) => d,
            Err(AssetError::UnsupportedContentType { content_type, .. }) => {
                warn!(%content_type, "skipping non-image resource");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let content_type = downloaded
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let metadata = vec![
            ("original-url".to_string(), url.to_string()),
            ("product-id".to_string(), owner_id.to_string()),
            ("product-title".to_string(), owner_label.to_string()),
            ("uploaded-at".to_string(), Utc::now().to_rfc3339()),
        ];
        store
            .put(&key, downloaded.bytes, &content_type, &metadata)
            .await?;
        Ok(Some(store.public_url(&key)))
    }

    async fn download(&self, url: &str) -> Result<Downloaded, AssetError> {
        let max = self.settings.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max {
            match self.fetcher.fetch(url).await {
                Ok(mut d) => {
                    let declared = d.content_type.clone().unwrap_or_default();
                    if is_image(&declared) {
                        return Ok(d);
                    }
                    // Missing or generic headers fall back to the file signature.
                    if is_untyped(&declared) {
                        if let Some(sniffed) = sniff_image(&d.bytes) {
                            debug!(declared = %declared, sniffed, "content type taken from file signature");
                            d.content_type = Some(sniffed.to_string());
                            return Ok(d);
                        }
                    }
                    return Err(AssetError::UnsupportedContentType {
                        url: url.to_string(),
                        content_type: declared,
                    });
                }
                Err(FetchError::Transient(msg)) => {
                    warn!(attempt, error = %msg, "image download failed; backing off");
                    last_error = msg;
                    if attempt < max {
                        self.sleeper.sleep(self.settings.backoff(attempt)).await;
                    }
                }
                Err(FetchError::Other(msg)) => {
                    debug!(attempt, error = %msg, "image download failed");
                    last_error = msg;
                }
            }
        }
        Err(AssetError::Download {
            url: url.to_string(),
            attempts: max,
            message: last_error,
        })
    }

    async fn relocate_product(&self, product: &mut SourceProduct) -> RelocationReport {
        let mut report = RelocationReport::default();
        for image in product.images.iter_mut() {
            report.images += 1;
            match self.relocate(&image.url, &product.id, &product.title).await {
                Ok(Some(new_url)) => {
                    image.url = new_url;
                    report.relocated += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(product = %product.id, image = %image.id, error = %err, "keeping original image url");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Relocate every product's images in fixed-width batches with a pause in
    /// between. Image URLs are rewritten in place.
    pub async fn relocate_products(&self, products: &mut [SourceProduct]) -> RelocationReport {
        let mut report = RelocationReport::default();
        if !self.is_enabled() {
            let images: usize = products.iter().map(|p| p.images.len()).sum();
            warn!(images, "durable storage not configured; image relocation skipped");
            report.images = images;
            report.skipped = images;
            return report;
        }

        let batch_size = self.settings.batch_size.max(1);
        let batches = products.len().div_ceil(batch_size);
        for (index, chunk) in products.chunks_mut(batch_size).enumerate() {
            let results = join_all(chunk.iter_mut().map(|p| self.relocate_product(p))).await;
            for r in &results {
                report.add(r);
            }
            debug!(batch = index + 1, batches, "relocation batch done");
            if index + 1 < batches {
                self.sleeper.sleep(self.settings.batch_pause).await;
            }
        }
        info!(
            images = report.images,
            relocated = report.relocated,
            skipped = report.skipped,
            failed = report.failed,
            "image relocation finished"
        );
        report
    }
}

fn is_image(content_type: &str) -> bool {
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("image/")
}

fn is_untyped(content_type: &str) -> bool {
    let ct = content_type.trim().to_ascii_lowercase();
    ct.is_empty() || ct.starts_with("application/octet-stream") || ct.starts_with("binary/octet-stream")
}

/// Image MIME type from the leading magic bytes.
fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [_, _, _, _, b'f', b't', b'y', b'p', b'a', b'v', b'i', b'f', ..] => Some("image/avif"),
        _ => None,
    }
}

/// `{prefix}/{filename}` from the URL path, query string dropped.
pub fn object_key(prefix: &str, url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
    let raw_name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
    let decoded = urlencoding::decode(raw_name)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw_name.to_string());
    let mut name: String = decoded
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.trim_matches(|c| c == '_' || c == '.').is_empty() {
        name = format!("image-{}", short_hash(url));
    }
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

fn short_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{SourceImage, SourceStatus};
    use crate::media::storage::testing::MemoryObjectStore;
    use crate::util::sleep::testing::RecordingSleeper;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    enum Step {
        Image,
        Html,
        Untyped(&'static [u8]),
        Transient,
        Other,
    }

    struct ScriptedFetcher {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<usize>,
    }

    impl ScriptedFetcher {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().map(|c| *c).unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<Downloaded, FetchError> {
            if let Ok(mut c) = self.calls.lock() {
                *c += 1;
            }
            let step = self
                .steps
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or(Step::Image);
            match step {
                Step::Image => Ok(Downloaded {
                    bytes: Bytes::from_static(b"\x89PNG"),
                    content_type: Some("image/png".into()),
                }),
                Step::Html => Ok(Downloaded {
                    bytes: Bytes::from_static(b"<html>"),
                    content_type: Some("text/html".into()),
                }),
                Step::Untyped(body) => Ok(Downloaded {
                    bytes: Bytes::from_static(body),
                    content_type: None,
                }),
                Step::Transient => Err(FetchError::Transient("connection reset".into())),
                Step::Other => Err(FetchError::Other("status 500".into())),
            }
        }
    }

    fn relocator(
        store: Option<Arc<MemoryObjectStore>>,
        fetcher: Arc<ScriptedFetcher>,
        sleeper: Arc<RecordingSleeper>,
    ) -> AssetRelocator {
        let store: Option<Arc<dyn ObjectStore>> = store.map(|s| s as Arc<dyn ObjectStore>);
        AssetRelocator::new(store, fetcher, sleeper, RelocatorSettings::default())
    }

    const URL: &str = "https://cdn.shopify.com/s/files/1/0001/files/lamp.png?v=1700000000";

    #[test]
    fn object_key_uses_filename_without_query() {
        assert_eq!(object_key("products", URL), "products/lamp.png");
        assert_eq!(
            object_key("/media/", "https://cdn.example.com/a/Lamp%20Shade.jpg"),
            "media/Lamp_Shade.jpg"
        );
        assert!(object_key("products", "https://cdn.example.com/").starts_with("products/image-"));
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let s = RelocatorSettings::default();
        assert_eq!(s.backoff(1), Duration::from_millis(1000));
        assert_eq!(s.backoff(3), Duration::from_millis(3000));
        assert_eq!(s.backoff(9), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn unconfigured_storage_skips() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let r = relocator(None, fetcher.clone(), Arc::new(RecordingSleeper::default()));
        assert_eq!(r.relocate(URL, "p1", "Lamp").await.unwrap(), None);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn uploads_with_provenance_metadata() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Image]));
        let r = relocator(Some(store.clone()), fetcher, Arc::new(RecordingSleeper::default()));
        let url = r.relocate(URL, "gid://shopify/Product/1", "Lamp").await.unwrap();
        assert_eq!(url.as_deref(), Some("https://media.example.com/products/lamp.png"));
        let meta = store.metadata("products/lamp.png");
        assert!(meta.contains(&("original-url".to_string(), URL.to_string())));
        assert!(meta.contains(&("product-id".to_string(), "gid://shopify/Product/1".to_string())));
        assert!(meta.iter().any(|(k, _)| k == "uploaded-at"));
    }

    #[tokio::test]
    async fn existing_object_short_circuits_download() {
        let store = Arc::new(MemoryObjectStore::default());
        store
            .put("products/lamp.png", Bytes::new(), "image/png", &[])
            .await
            .unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let r = relocator(Some(store), fetcher.clone(), Arc::new(RecordingSleeper::default()));
        let url = r.relocate(URL, "p1", "Lamp").await.unwrap();
        assert_eq!(url.as_deref(), Some("https://media.example.com/products/lamp.png"));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_succeed() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Transient, Step::Transient, Step::Image]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let r = relocator(Some(store), fetcher.clone(), sleeper.clone());
        assert!(r.relocate(URL, "p1", "Lamp").await.unwrap().is_some());
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn non_network_failures_retry_without_delay_then_error() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Other, Step::Other, Step::Other]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let r = relocator(Some(store), fetcher.clone(), sleeper.clone());
        match r.relocate(URL, "p1", "Lamp").await {
            Err(AssetError::Download { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(fetcher.calls(), 3);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn non_image_content_is_rejected_without_retry() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Html]));
        let r = relocator(Some(store.clone()), fetcher.clone(), Arc::new(RecordingSleeper::default()));
        assert_eq!(r.relocate(URL, "p1", "Lamp").await.unwrap(), None);
        assert_eq!(fetcher.calls(), 1);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn missing_content_type_is_sniffed_from_file_signature() {
        let store = Arc::new(MemoryObjectStore::default());
        let jpeg: &'static [u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Untyped(jpeg)]));
        let r = relocator(Some(store.clone()), fetcher, Arc::new(RecordingSleeper::default()));
        let url = r.relocate(URL, "p1", "Lamp").await.unwrap();
        assert_eq!(url.as_deref(), Some("https://media.example.com/products/lamp.png"));
        assert_eq!(store.content_type("products/lamp.png").as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn untyped_non_image_body_is_still_rejected() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Untyped(b"<html></html>")]));
        let r = relocator(Some(store.clone()), fetcher.clone(), Arc::new(RecordingSleeper::default()));
        assert_eq!(r.relocate(URL, "p1", "Lamp").await.unwrap(), None);
        assert_eq!(fetcher.calls(), 1);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn file_signatures() {
        assert_eq!(sniff_image(b"\x89PNG\r\n"), Some("image/png"));
        assert_eq!(sniff_image(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_image(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image(b"\0\0\0\x1cftypavif"), Some("image/avif"));
        assert_eq!(sniff_image(b"%PDF-1.7"), None);
        assert_eq!(sniff_image(b""), None);
    }

    fn product_with_images(id: &str, urls: &[&str]) -> SourceProduct {
        SourceProduct {
            id: id.into(),
            title: id.into(),
            status: SourceStatus::Active,
            description: None,
            options: vec![],
            tags: vec![],
            metafields: BTreeMap::new(),
            images: urls
                .iter()
                .enumerate()
                .map(|(i, u)| SourceImage {
                    id: format!("{id}-img-{i}"),
                    url: u.to_string(),
                    alt: None,
                })
                .collect(),
            variants: vec![],
            collections: vec![],
        }
    }

    #[tokio::test]
    async fn batches_pause_between_and_failures_keep_original_urls() {
        let store = Arc::new(MemoryObjectStore {
            fail_puts: true,
            ..MemoryObjectStore::default()
        });
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let r = relocator(Some(store), fetcher, sleeper.clone());
        let mut products: Vec<SourceProduct> = (0..7)
            .map(|i| product_with_images(&format!("p{i}"), &[&format!("https://cdn.example.com/{i}.png")]))
            .collect();
        let report = r.relocate_products(&mut products).await;
        assert_eq!(report.images, 7);
        assert_eq!(report.failed, 7);
        assert_eq!(products[0].images[0].url, "https://cdn.example.com/0.png");
        // 7 products in batches of 5 -> one pause.
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(1000)]);
    }

    #[tokio::test]
    async fn successful_relocation_rewrites_urls_in_place() {
        let store = Arc::new(MemoryObjectStore::default());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let r = relocator(Some(store), fetcher, Arc::new(RecordingSleeper::default()));
        let mut products = vec![product_with_images("p1", &["https://cdn.example.com/a.png", "https://cdn.example.com/b.png"])];
        let report = r.relocate_products(&mut products).await;
        assert_eq!(report.relocated, 2);
        assert_eq!(products[0].images[1].url, "https://media.example.com/products/b.png");
    }
}
