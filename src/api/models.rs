// Request/response bodies for the trigger surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runs::RunRecord;

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub meta: Meta,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Meta::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Meta::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub uptime_seconds: u64,
}

/// `{"type": ["product", "category"]}`
#[derive(Debug, Deserialize)]
pub struct MigrationTriggerRequest {
    #[serde(rename = "type")]
    pub types: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionsResponse {
    pub executions: Vec<RunRecord>,
    pub count: i64,
}
