//! Durable object storage for relocated product media.
//!
//! `S3Store` speaks the S3 REST API directly with SigV4-signed requests, so any
//! S3-compatible endpoint works when `MEDIA_S3_ENDPOINT` is set.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::AssetError;
use crate::util::env::{env_opt, env_parse};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, AssetError>;

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<(), AssetError>;

    /// Deterministic public URL for `key`.
    fn public_url(&self, key: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    pub prefix: String,
}

impl StorageConfig {
    /// `None` when any credential is missing; relocation is then skipped.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            bucket: env_opt("MEDIA_S3_BUCKET")?,
            region: env_opt("MEDIA_S3_REGION")?,
            access_key_id: env_opt("MEDIA_S3_ACCESS_KEY_ID")?,
            secret_access_key: env_opt("MEDIA_S3_SECRET_ACCESS_KEY")?,
            endpoint: env_opt("MEDIA_S3_ENDPOINT").map(|e| e.trim_end_matches('/').to_string()),
            prefix: env_parse("MEDIA_S3_PREFIX", "products".to_string()),
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

pub struct S3Store {
    cfg: StorageConfig,
    http: Client,
}

impl S3Store {
    pub fn new(cfg: StorageConfig) -> Result<Self, AssetError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AssetError::Storage {
                key: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { cfg, http })
    }

    /// Host header value and canonical path for `key`.
    fn locate(&self, key: &str) -> (String, String) {
        let encoded = encode_key(key);
        match &self.cfg.endpoint {
            Some(endpoint) => {
                let host = url::Url::parse(endpoint)
                    .ok()
                    .and_then(|u| {
                        u.host_str().map(|h| match u.port() {
                            Some(p) => format!("{h}:{p}"),
                            None => h.to_string(),
                        })
                    })
                    .unwrap_or_else(|| endpoint.clone());
                (host, format!("/{}/{}", self.cfg.bucket, encoded))
            }
            None => (
                format!("{}.s3.{}.amazonaws.com", self.cfg.bucket, self.cfg.region),
                format!("/{encoded}"),
            ),
        }
    }

    fn request_url(&self, key: &str) -> String {
        let (host, path) = self.locate(key);
        match &self.cfg.endpoint {
            Some(endpoint) if endpoint.starts_with("http://") => format!("http://{host}{path}"),
            _ => format!("https://{host}{path}"),
        }
    }

    fn signed_headers(
        &self,
        method: &str,
        key: &str,
        payload_hash: &str,
        extra: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let (host, path) = self.locate(key);
        let request = SigningRequest {
            method,
            host: &host,
            path: &path,
            payload_hash,
            extra,
        };
        sign_v4(&self.cfg, &request, now)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, AssetError> {
        let headers = self.signed_headers("HEAD", key, &sha256_hex(b""), &[], Utc::now());
        let mut req = self.http.head(self.request_url(key));
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await.map_err(|e| AssetError::Storage {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            // Without s3:ListBucket a missing object answers 403.
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            other => Err(AssetError::Storage {
                key: key.to_string(),
                message: format!("unexpected status {other}"),
            }),
        }
    }

    #[instrument(skip(self, body, metadata), fields(bytes = body.len()))]
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<(), AssetError> {
        let mut extra: Vec<(String, String)> =
            vec![("content-type".to_string(), content_type.to_string())];
        for (name, value) in metadata {
            extra.push((
                format!("x-amz-meta-{}", name.to_ascii_lowercase()),
                urlencoding::encode(value).into_owned(),
            ));
        }
        let headers = self.signed_headers("PUT", key, &sha256_hex(&body), &extra, Utc::now());
        let mut req = self.http.put(self.request_url(key)).body(body);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await.map_err(|e| AssetError::Upload {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AssetError::Upload {
                key: key.to_string(),
                message: format!("status {status}: {text}"),
            });
        }
        debug!(%key, "object stored");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        match &self.cfg.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint, self.cfg.bucket, encode_key(key)),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.cfg.bucket,
                self.cfg.region,
                encode_key(key)
            ),
        }
    }
}

struct SigningRequest<'a> {
    method: &'a str,
    host: &'a str,
    path: &'a str,
    payload_hash: &'a str,
    extra: &'a [(String, String)],
}

/// AWS Signature Version 4 headers (including `authorization`) for one request.
fn sign_v4(
    cfg: &StorageConfig,
    req: &SigningRequest<'_>,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".to_string(), req.host.to_string()),
        ("x-amz-content-sha256".to_string(), req.payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    headers.extend(
        req.extra
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string())),
    );
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        req.method, req.path, canonical_headers, signed_headers, req.payload_hash
    );

    let scope = format!("{date}/{}/s3/aws4_request", cfg.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac(format!("AWS4{}", cfg.secret_access_key).as_bytes(), &date);
    let k_region = hmac(&k_date, &cfg.region);
    let k_service = hmac(&k_region, "s3");
    let k_signing = hmac(&k_service, "aws4_request");
    let signature = to_hex(&hmac(&k_signing, &string_to_sign));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        cfg.access_key_id
    );
    // reqwest sets Host itself.
    headers.retain(|(k, _)| k != "host");
    headers.push(("authorization".to_string(), authorization));
    headers
}

/// HMAC accepts keys of any length.
fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    HmacSha256::new_from_slice(key)
        .map(|mut mac| {
            mac.update(data.as_bytes());
            mac.finalize().into_bytes().to_vec()
        })
        .unwrap_or_default()
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg(endpoint: Option<&str>) -> StorageConfig {
        StorageConfig {
            bucket: "catalog-media".into(),
            region: "eu-west-1".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            endpoint: endpoint.map(String::from),
            prefix: "products".into(),
        }
    }

    #[test]
    fn public_urls_follow_bucket_region_and_key() {
        let store = S3Store::new(cfg(None)).unwrap();
        assert_eq!(
            store.public_url("products/lamp shade.jpg"),
            "https://catalog-media.s3.eu-west-1.amazonaws.com/products/lamp%20shade.jpg"
        );
        let store = S3Store::new(cfg(Some("http://localhost:9000"))).unwrap();
        assert_eq!(
            store.public_url("products/lamp.jpg"),
            "http://localhost:9000/catalog-media/products/lamp.jpg"
        );
        assert_eq!(
            store.request_url("products/lamp.jpg"),
            "http://localhost:9000/catalog-media/products/lamp.jpg"
        );
    }

    #[test]
    fn signature_is_deterministic_and_scoped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let config = cfg(None);
        let extra = vec![("content-type".to_string(), "image/jpeg".to_string())];
        let request = SigningRequest {
            method: "PUT",
            host: "catalog-media.s3.eu-west-1.amazonaws.com",
            path: "/products/lamp.jpg",
            payload_hash: &sha256_hex(b"bytes"),
            extra: &extra,
        };
        let first = sign_v4(&config, &request, now);
        let second = sign_v4(&config, &request, now);
        assert_eq!(first, second);

        let auth = first
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/eu-west-1/s3/aws4_request, \
             SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(first.iter().all(|(k, _)| k != "host"));
        assert!(first
            .iter()
            .any(|(k, v)| k == "x-amz-date" && v == "20240501T120000Z"));
    }

    #[test]
    fn empty_payload_hash_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
