//! Daily trigger for the API server process.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{error, info};

use crate::pipeline::{parse_kinds, SyncKind, Syncer};
use crate::util::env::{env_flag, env_list, env_parse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// UTC hour of day, 0-23.
    pub hour: u32,
    pub kinds: Vec<SyncKind>,
}

impl ScheduleConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let hour: u32 = env_parse("SYNC_SCHEDULE_HOUR_UTC", 0u32);
        if hour > 23 {
            anyhow::bail!("SYNC_SCHEDULE_HOUR_UTC must be 0-23, got {hour}");
        }
        let kinds = parse_kinds(&env_list("SYNC_SCHEDULE_TYPES", &["product", "category"]))
            .map_err(|e| anyhow::anyhow!("SYNC_SCHEDULE_TYPES: {e}"))?;
        Ok(Self {
            enabled: env_flag("SYNC_SCHEDULE_ENABLED", true),
            hour,
            kinds,
        })
    }
}

/// First `hour:00:00` UTC strictly after `now`.
pub fn next_fire(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// Sleep until each daily slot and trigger the configured kinds. Never returns.
pub async fn run_daily(syncer: Arc<Syncer>, cfg: ScheduleConfig) {
    loop {
        let now = Utc::now();
        let at = next_fire(now, cfg.hour);
        info!(next = %at, kinds = ?cfg.kinds, "next scheduled sync");
        let wait = (at - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match syncer.trigger(&cfg.kinds).await {
            Ok(results) => info!(?results, "scheduled sync finished"),
            Err(err) => error!(error = %format!("{err:#}"), "scheduled sync could not record its runs"),
        }
    }
}
