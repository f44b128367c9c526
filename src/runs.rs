//! Sync run records, listed most recent first by the execution endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use std::sync::Mutex;
use uuid::Uuid;

use crate::util::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub kind: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait RunLog: Send + Sync {
    async fn start(&self, kind: &str) -> Result<Uuid>;

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        summary: Option<Value>,
        error: Option<String>,
    ) -> Result<()>;

    /// Newest first, with the total number of records.
    async fn list(&self, limit: i64) -> Result<(Vec<RunRecord>, i64)>;
}

pub struct PgRunLog {
    db: Db,
}

impl PgRunLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RunLog for PgRunLog {
    async fn start(&self, kind: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sync_runs (id, kind, status, started_at) VALUES ($1, $2, 'running', now())",
        )
        .persistent(false)
        .bind(id)
        .bind(kind)
        .execute(&self.db.pool)
        .await
        .context("recording run start")?;
        Ok(id)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        summary: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET status = $2, finished_at = now(), summary = $3, error = $4
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(status.as_str())
        .bind(summary)
        .bind(error)
        .execute(&self.db.pool)
        .await
        .context("recording run finish")?;
        Ok(())
    }

    async fn list(&self, limit: i64) -> Result<(Vec<RunRecord>, i64)> {
        let rows = sqlx::query(
            "SELECT id, kind, status, started_at, finished_at, summary, error
             FROM sync_runs ORDER BY started_at DESC LIMIT $1",
        )
        .persistent(false)
        .bind(limit.max(0))
        .fetch_all(&self.db.pool)
        .await
        .context("listing runs")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            records.push(RunRecord {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                summary: row.try_get("summary")?,
                error: row.try_get("error")?,
            });
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await
            .context("counting runs")?;
        Ok((records, count))
    }
}

/// Process-local run log for tests and the CLI when no database is wanted.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    records: Mutex<Vec<RunRecord>>,
}

impl MemoryRunLog {
    fn with_records<T>(&self, f: impl FnOnce(&mut Vec<RunRecord>) -> T) -> Result<T> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("run log poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn start(&self, kind: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.with_records(|r| {
            r.push(RunRecord {
                id,
                kind: kind.to_string(),
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                summary: None,
                error: None,
            })
        })?;
        Ok(id)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        summary: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        self.with_records(|records| {
            if let Some(r) = records.iter_mut().find(|r| r.id == id) {
                r.status = status;
                r.finished_at = Some(Utc::now());
                r.summary = summary;
                r.error = error;
            }
        })
    }

    async fn list(&self, limit: i64) -> Result<(Vec<RunRecord>, i64)> {
        self.with_records(|records| {
            let count = records.len() as i64;
            let newest_first = records
                .iter()
                .rev()
                .take(limit.max(0) as usize)
                .cloned()
                .collect();
            (newest_first, count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_log_lists_newest_first() {
        let log = MemoryRunLog::default();
        let first = log.start("category").await.unwrap();
        let second = log.start("product").await.unwrap();
        log.finish(first, RunStatus::Succeeded, Some(serde_json::json!({"ok": 1})), None)
            .await
            .unwrap();
        log.finish(second, RunStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();

        let (records, count) = log.list(10).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(records[0].id, second);
        assert_eq!(records[0].status, RunStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("boom"));
        assert_eq!(records[1].status, RunStatus::Succeeded);
        assert!(records[1].finished_at.is_some());

        let (limited, count) = log.list(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Skipped,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
    }
}
