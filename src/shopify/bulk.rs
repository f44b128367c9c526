//! Bulk export client.
//!
//! The platform runs at most one bulk query per account, so a run walks an
//! explicit state machine:
//!
//! ```text
//! Inspecting ──(active op)──> Canceling ──(cleared)──> Submitting ──> Polling ──> Downloading
//!      └──────────(idle)──────────────────────────────────^            └─> FAILED / CANCELED / EXPIRED => error
//! ```
//!
//! Every wait goes through the injected [`Sleeper`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::client::{AdminApi, ShopifyConfig};
use super::queries::{BULK_CANCEL, BULK_RUN_QUERY, CURRENT_BULK_OPERATION};
use crate::error::BulkError;
use crate::util::sleep::Sleeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkStatus {
    Created,
    Running,
    Completed,
    Canceling,
    Canceled,
    Failed,
    Expired,
    #[serde(other)]
    Unknown,
}

impl BulkStatus {
    /// Still occupying the account's single bulk slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BulkStatus::Created | BulkStatus::Running | BulkStatus::Canceling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BulkStatus::Created => "CREATED",
            BulkStatus::Running => "RUNNING",
            BulkStatus::Completed => "COMPLETED",
            BulkStatus::Canceling => "CANCELING",
            BulkStatus::Canceled => "CANCELED",
            BulkStatus::Failed => "FAILED",
            BulkStatus::Expired => "EXPIRED",
            BulkStatus::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperation {
    pub id: String,
    pub status: BulkStatus,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub max_polls: Option<u32>,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            cancel_poll_interval: Duration::from_millis(2000),
            max_polls: None,
        }
    }
}

impl From<&ShopifyConfig> for BulkSettings {
    fn from(cfg: &ShopifyConfig) -> Self {
        Self {
            poll_interval: cfg.bulk_poll,
            cancel_poll_interval: cfg.cancel_poll,
            max_polls: cfg.max_polls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Inspecting,
    Canceling { id: String },
    Submitting,
    Polling { id: String },
    Downloading { url: Option<String> },
}

pub struct BulkExporter {
    api: Arc<dyn AdminApi>,
    sleeper: Arc<dyn Sleeper>,
    settings: BulkSettings,
}

impl BulkExporter {
    pub fn new(api: Arc<dyn AdminApi>, sleeper: Arc<dyn Sleeper>, settings: BulkSettings) -> Self {
        Self {
            api,
            sleeper,
            settings,
        }
    }

    /// Export `query` and return the raw result lines. A completed run without a
    /// result URL is an empty catalog, not an error.
    #[instrument(skip(self, query))]
    pub async fn run(&self, query: &str) -> Result<Vec<String>, BulkError> {
        let mut phase = Phase::Inspecting;
        let mut polls = 0u32;
        loop {
            debug!(?phase, polls, "bulk export step");
            phase = match phase {
                Phase::Inspecting => match self.current().await? {
                    Some(op) if op.status.is_active() => {
                        warn!(id = %op.id, status = op.status.as_str(), "cancelling in-flight bulk operation");
                        if op.status != BulkStatus::Canceling {
                            self.cancel(&op.id).await?;
                        }
                        polls = 0;
                        Phase::Canceling { id: op.id }
                    }
                    _ => Phase::Submitting,
                },
                Phase::Canceling { id } => {
                    self.wait(&mut polls, self.settings.cancel_poll_interval)
                        .await?;
                    match self.current().await? {
                        Some(op) if op.status.is_active() && op.id == id => {
                            Phase::Canceling { id }
                        }
                        Some(op) if op.status.is_active() => Phase::Inspecting,
                        _ => {
                            info!(%id, "stale bulk operation cleared");
                            Phase::Submitting
                        }
                    }
                }
                Phase::Submitting => {
                    let id = self.submit(query).await?;
                    info!(%id, "bulk operation submitted");
                    polls = 0;
                    Phase::Polling { id }
                }
                Phase::Polling { id } => {
                    self.wait(&mut polls, self.settings.poll_interval).await?;
                    let Some(op) = self.current().await? else {
                        return Err(BulkError::execution(
                            "MISSING_OPERATION",
                            format!("no current bulk operation while polling {id}"),
                        ));
                    };
                    if op.id != id {
                        return Err(BulkError::execution(
                            "SUPERSEDED",
                            format!("bulk operation {id} was replaced by {}", op.id),
                        ));
                    }
                    match op.status {
                        BulkStatus::Completed => Phase::Downloading { url: op.url },
                        BulkStatus::Failed => {
                            let code = op.error_code.unwrap_or_else(|| "UNKNOWN".into());
                            return Err(BulkError::execution(
                                code,
                                format!("bulk operation {id} failed"),
                            ));
                        }
                        BulkStatus::Canceled | BulkStatus::Expired => {
                            return Err(BulkError::execution(
                                op.status.as_str(),
                                format!("bulk operation {id} ended before completing"),
                            ));
                        }
                        _ => Phase::Polling { id },
                    }
                }
                Phase::Downloading { url: None } => {
                    info!("bulk operation completed with no result document");
                    return Ok(Vec::new());
                }
                Phase::Downloading { url: Some(url) } => {
                    let text = self.api.fetch_text(&url).await?;
                    let lines = split_lines(&text);
                    info!(lines = lines.len(), "bulk result downloaded");
                    return Ok(lines);
                }
            };
        }
    }

    async fn wait(&self, polls: &mut u32, interval: Duration) -> Result<(), BulkError> {
        if let Some(max) = self.settings.max_polls {
            if *polls >= max {
                return Err(BulkError::execution(
                    "POLL_TIMEOUT",
                    format!("bulk operation still pending after {max} polls"),
                ));
            }
        }
        *polls += 1;
        self.sleeper.sleep(interval).await;
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<BulkOperation>, BulkError> {
        let data = self.api.graphql(CURRENT_BULK_OPERATION, json!({})).await?;
        match data.get("currentBulkOperation") {
            None | Some(Value::Null) => Ok(None),
            Some(op) => serde_json::from_value(op.clone())
                .map(Some)
                .map_err(|e| BulkError::Decode(e.to_string())),
        }
    }

    async fn cancel(&self, id: &str) -> Result<(), BulkError> {
        let data = self.api.graphql(BULK_CANCEL, json!({ "id": id })).await?;
        let errors = user_errors(data.pointer("/bulkOperationCancel/userErrors"));
        if !errors.is_empty() {
            // Usually a race with the operation finishing on its own; the poll decides.
            warn!(%id, errors = ?errors, "bulk cancel reported user errors");
        }
        Ok(())
    }

    async fn submit(&self, query: &str) -> Result<String, BulkError> {
        let data = self
            .api
            .graphql(BULK_RUN_QUERY, json!({ "query": query }))
            .await?;
        let errors = user_errors(data.pointer("/bulkOperationRunQuery/userErrors"));
        if !errors.is_empty() {
            return Err(BulkError::Submit(errors));
        }
        data.pointer("/bulkOperationRunQuery/bulkOperation/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BulkError::Decode("submission returned no bulk operation".into()))
    }
}

fn user_errors(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .map(|e| {
                    let message = e.get("message").and_then(Value::as_str).unwrap_or("invalid");
                    match e.get("field").and_then(Value::as_array) {
                        Some(path) if !path.is_empty() => {
                            let field: Vec<&str> = path.iter().filter_map(Value::as_str).collect();
                            format!("{}: {}", field.join("."), message)
                        }
                        _ => message.to_string(),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Admin API fake: `currentBulkOperation` answers come from a queue (null
    /// once drained), mutations are recorded.
    pub struct ScriptedApi {
        pub current: Mutex<VecDeque<Value>>,
        pub submit_response: Value,
        pub body: String,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        pub fn new(current: Vec<Value>, body: &str) -> Self {
            Self {
                current: Mutex::new(current.into()),
                submit_response: json!({
                    "bulkOperation": {"id": "gid://shopify/BulkOperation/2", "status": "CREATED"},
                    "userErrors": []
                }),
                body: body.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_submit(mut self, response: Value) -> Self {
            self.submit_response = response;
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    pub fn op(id: u32, status: &str, error_code: Option<&str>, url: Option<&str>) -> Value {
        json!({
            "id": format!("gid://shopify/BulkOperation/{id}"),
            "status": status,
            "errorCode": error_code,
            "url": url,
        })
    }

    #[async_trait]
    impl AdminApi for ScriptedApi {
        async fn graphql(&self, query: &str, variables: Value) -> Result<Value, BulkError> {
            if query.contains("bulkOperationRunQuery") {
                self.record("submit".into());
                return Ok(json!({ "bulkOperationRunQuery": self.submit_response }));
            }
            if query.contains("bulkOperationCancel") {
                let id = variables.get("id").and_then(Value::as_str).unwrap_or_default();
                self.record(format!("cancel:{id}"));
                return Ok(json!({
                    "bulkOperationCancel": {"bulkOperation": {"id": id, "status": "CANCELING"}, "userErrors": []}
                }));
            }
            self.record("current".into());
            let next = self
                .current
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(Value::Null);
            Ok(json!({ "currentBulkOperation": next }))
        }

        async fn fetch_text(&self, url: &str) -> Result<String, BulkError> {
            self.record(format!("fetch:{url}"));
            Ok(self.body.clone())
        }
    }
}
