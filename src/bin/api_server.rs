// HTTP trigger surface plus the daily schedule.

use anyhow::Result;
use shopify_sync::api::{ApiServer, AppState};
use shopify_sync::logging::init_tracing;
use shopify_sync::pipeline::Syncer;
use shopify_sync::scheduler::{self, ScheduleConfig};
use shopify_sync::util::env as env_util;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn,actix_web=info")?;
    env_util::init_env();
    env_util::preflight_check(
        "api_server",
        &["SHOPIFY_STORE_DOMAIN", "SHOPIFY_ADMIN_TOKEN", "API_SECRET"],
        &[
            "SHOPIFY_STORE_DOMAIN",
            "SHOPIFY_API_VERSION",
            "DATABASE_URL",
            "MEDIA_S3_BUCKET",
            "MEDIA_S3_REGION",
            "SYNC_SCHEDULE_ENABLED",
            "SYNC_SCHEDULE_HOUR_UTC",
            "SYNC_SCHEDULE_TYPES",
        ],
    )?;

    let server = ApiServer::from_env()?;
    let schedule = ScheduleConfig::from_env()?;

    let db = Syncer::connect_db().await?;
    let syncer = Arc::new(Syncer::from_env(db.clone()).await?);

    if schedule.enabled {
        tracing::info!(hour = schedule.hour, kinds = ?schedule.kinds, "daily schedule enabled");
        actix_web::rt::spawn(scheduler::run_daily(syncer.clone(), schedule));
    } else {
        tracing::info!("daily schedule disabled");
    }

    server.run(AppState::new(syncer, Some(db))).await
}
