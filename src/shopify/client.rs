use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::BulkError;
use crate::util::env::{env_parse, env_parse_opt, env_req};

const DEFAULT_API_VERSION: &str = "2025-01";

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub store_domain: String,
    pub admin_token: String,
    pub api_version: String,
    pub bulk_poll: Duration,
    pub cancel_poll: Duration,
    /// Upper bound on status polls; `None` polls until a terminal status.
    pub max_polls: Option<u32>,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl ShopifyConfig {
    pub fn from_env() -> Result<Self> {
        let store_domain = env_req("SHOPIFY_STORE_DOMAIN")?;
        let admin_token = env_req("SHOPIFY_ADMIN_TOKEN")?;
        Ok(Self {
            store_domain: normalize_domain(&store_domain),
            admin_token,
            api_version: env_parse("SHOPIFY_API_VERSION", DEFAULT_API_VERSION.to_string()),
            bulk_poll: Duration::from_millis(env_parse("SHOPIFY_BULK_POLL_MS", 2000u64)),
            cancel_poll: Duration::from_millis(env_parse("SHOPIFY_CANCEL_POLL_MS", 2000u64)),
            max_polls: env_parse_opt("SHOPIFY_BULK_MAX_POLLS"),
            max_retries: env_parse("SHOPIFY_MAX_RETRIES", 3u32),
            backoff_ms: env_parse("SHOPIFY_BACKOFF_MS", 1000u64),
        })
    }

    pub fn graphql_endpoint(&self) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            self.store_domain, self.api_version
        )
    }
}

/// `https://my-shop.myshopify.com/` -> `my-shop.myshopify.com`
fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Admin API surface the bulk exporter needs.
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Run a GraphQL document and return its `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, BulkError>;

    /// Download a bulk result document.
    async fn fetch_text(&self, url: &str) -> Result<String, BulkError>;
}

pub struct ShopifyClient {
    cfg: ShopifyConfig,
    http: Client,
}

impl ShopifyClient {
    pub fn new(cfg: ShopifyConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("shopify-sync/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to construct Shopify HTTP client")?;
        Ok(Self { cfg, http })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ShopifyConfig::from_env()?)
    }

    pub fn config(&self) -> &ShopifyConfig {
        &self.cfg
    }

    async fn backoff(&self, attempt: u32) {
        let wait = self.cfg.backoff_ms * (attempt as u64 + 1);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
}

#[async_trait]
impl AdminApi for ShopifyClient {
    #[instrument(skip(self, query, variables))]
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, BulkError> {
        let endpoint = self.cfg.graphql_endpoint();
        let body = json!({ "query": query, "variables": variables });
        let mut attempt = 0u32;
        loop {
            let response = self
                .http
                .post(&endpoint)
                .header("X-Shopify-Access-Token", &self.cfg.admin_token)
                .json(&body)
                .send()
                .await;

            let resp = match response {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.cfg.max_retries {
                        return Err(BulkError::Transport(err.to_string()));
                    }
                    warn!(attempt, error = %err, "shopify request failed; retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt >= self.cfg.max_retries {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(BulkError::Transport(format!(
                        "shopify request failed after retries (status={status}): {text}"
                    )));
                }
                self.backoff(attempt).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(BulkError::Transport(format!(
                    "shopify request failed (status={status}): {text}"
                )));
            }

            let payload: Value = resp
                .json()
                .await
                .map_err(|e| BulkError::Decode(e.to_string()))?;
            if is_throttled(&payload) && attempt < self.cfg.max_retries {
                debug!(attempt, "graphql throttled; backing off");
                self.backoff(attempt).await;
                attempt += 1;
                continue;
            }
            return extract_data(payload);
        }
    }

    #[instrument(skip(self, url))]
    async fn fetch_text(&self, url: &str) -> Result<String, BulkError> {
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .map_err(|e| BulkError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BulkError::Transport(format!(
                "bulk result download failed (status={status})"
            )));
        }
        resp.text()
            .await
            .map_err(|e| BulkError::Transport(e.to_string()))
    }
}

fn is_throttled(payload: &Value) -> bool {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter().any(|e| {
                e.pointer("/extensions/code").and_then(Value::as_str) == Some("THROTTLED")
            })
        })
        .unwrap_or(false)
}

/// Top-level GraphQL `errors` fail the call; otherwise hand back `data`.
fn extract_data(mut payload: Value) -> Result<Value, BulkError> {
    if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown graphql error")
                        .to_string()
                })
                .collect();
            return Err(BulkError::Transport(messages.join("; ")));
        }
    }
    match payload.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(BulkError::Decode("response has no data".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_normalized() {
        assert_eq!(normalize_domain("https://shop.myshopify.com/"), "shop.myshopify.com");
        assert_eq!(normalize_domain(" shop.myshopify.com "), "shop.myshopify.com");
    }

    #[test]
    fn graphql_errors_fail_the_call() {
        let payload = json!({"errors": [{"message": "Field 'x' doesn't exist"}]});
        match extract_data(payload) {
            Err(BulkError::Transport(msg)) => assert!(msg.contains("doesn't exist")),
            other => panic!("unexpected: {other:?}"),
        }
        let ok = extract_data(json!({"data": {"currentBulkOperation": null}})).unwrap();
        assert!(ok.get("currentBulkOperation").is_some());
    }

    #[test]
    fn throttle_detection_reads_extension_code() {
        let payload = json!({"errors": [{"message": "Throttled", "extensions": {"code": "THROTTLED"}}]});
        assert!(is_throttled(&payload));
        assert!(!is_throttled(&json!({"data": {}})));
    }
}
