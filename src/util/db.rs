use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connecting to destination database")?;
        info!("connected to db");

        // Default off: the destination schema is usually owned by the commerce platform.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool, Path::new("./migrations")).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    /// Lightweight migration runner: applies `NNNN_description.sql` files in numeric
    /// order and records them in `_sync_migrations`. Non-numeric filenames are ignored.
    async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sync_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for r in sqlx::raw_sql("SELECT version FROM _sync_migrations")
            .fetch_all(pool)
            .await?
        {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut candidates = migration_candidates(dir)?;
        candidates.sort_by_key(|(v, _, _)| *v);
        for (version, desc, path) in candidates {
            if !applied.insert(version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration");
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(sql.trim()).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _sync_migrations(version, description) VALUES ($1, $2)")
                .bind(version)
                .bind(&desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

fn migration_candidates(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            out.push((version, desc, path));
        }
    }
    Ok(out)
}

/// `0002_sync_runs.sql` -> `(2, "sync_runs")`
fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let (num, rest) = stem.split_once('_')?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, rest.to_string()))
}
