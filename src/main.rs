use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use shopify_sync::logging::init_tracing;
use shopify_sync::pipeline::{export_catalog, exporter_from_env, parse_kinds, SyncKind, Syncer};
use shopify_sync::runs::{PgRunLog, RunLog, RunStatus};
use shopify_sync::util::env as env_util;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "shopify-sync", version, about = "Shopify catalog sync operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync per selected type (categories always run before products)
    Run {
        /// product, category or collection; repeat or comma-separate
        #[arg(long = "type", value_delimiter = ',', required = true)]
        types: Vec<String>,
        /// Plan against the destination without writing or uploading anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// List recent run records, newest first
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Export, assemble and normalize one kind and print it as JSON
    Export {
        #[arg(long)]
        kind: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn parse_one(raw: &str) -> Result<SyncKind> {
    raw.parse::<SyncKind>().map_err(|e| anyhow::anyhow!(e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    env_util::init_env();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { types, dry_run } => {
            let kinds = parse_kinds(&types).map_err(|e| anyhow::anyhow!(e))?;
            env_util::preflight_check(
                "shopify-sync run",
                &["SHOPIFY_STORE_DOMAIN", "SHOPIFY_ADMIN_TOKEN"],
                &["SHOPIFY_STORE_DOMAIN", "SHOPIFY_API_VERSION", "MEDIA_S3_BUCKET", "DATABASE_URL"],
            )?;
            let db = Syncer::connect_db().await?;
            let syncer = Syncer::from_env(db).await?.dry_run(dry_run);
            let results = syncer.trigger(&kinds).await?;
            let mut failed = false;
            for r in &results {
                match r.status {
                    RunStatus::Failed => {
                        failed = true;
                        error!(kind = r.kind.as_str(), error = ?r.error, "run failed");
                    }
                    status => info!(kind = r.kind.as_str(), status = status.as_str(), "run done"),
                }
            }
            if failed {
                anyhow::bail!("one or more sync runs failed");
            }
        }
        Command::Runs { limit } => {
            let db = Syncer::connect_db().await?;
            let (records, count) = PgRunLog::new(db).list(limit).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "executions": records,
                    "count": count,
                }))?
            );
        }
        Command::Export { kind, out } => {
            let kind = parse_one(&kind)?;
            let exporter = exporter_from_env()?;
            let dump = export_catalog(&exporter, kind).await?;
            let text = serde_json::to_string_pretty(&dump)?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, text)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "export written");
                }
                None => println!("{text}"),
            }
        }
    }
    Ok(())
}
