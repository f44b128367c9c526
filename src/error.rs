//! Typed failures for the sync pipeline.
//!
//! Only [`BulkError`] is run-fatal. Asset and store errors are scoped to a
//! single image or a single write and are degraded by their callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BulkError {
    /// The platform rejected the bulk query at submission (`userErrors`).
    #[error("bulk query rejected at submission: {}", .0.join("; "))]
    Submit(Vec<String>),

    /// The bulk run failed or the operation state became inconsistent.
    #[error("bulk operation failed ({code}): {message}")]
    Execution { code: String, message: String },

    #[error("shopify transport error: {0}")]
    Transport(String),

    #[error("shopify response could not be decoded: {0}")]
    Decode(String),
}

impl BulkError {
    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Execution {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Platform error code for execution failures.
    pub fn code(&self) -> Option<&str> {
        match self {
            BulkError::Execution { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("durable storage is not configured")]
    NotConfigured,

    #[error("download failed after {attempts} attempt(s) for {url}: {message}")]
    Download {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("not an image ({content_type}): {url}")]
    UnsupportedContentType { url: String, content_type: String },

    #[error("upload failed for key {key}: {message}")]
    Upload { key: String, message: String },

    #[error("storage lookup failed for key {key}: {message}")]
    Storage { key: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination query failed: {0}")]
    Query(String),

    #[error("destination write failed: {0}")]
    Write(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}
