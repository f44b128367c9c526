// HTTP request handlers

use crate::api::models::*;
use crate::pipeline::{parse_kinds, Syncer};
use crate::util::db::Db;
use actix_web::{web, HttpResponse, Result};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub syncer: Arc<Syncer>,
    pub db: Option<Db>,
    pub started: Instant,
}

impl AppState {
    pub fn new(syncer: Arc<Syncer>, db: Option<Db>) -> Self {
        Self {
            syncer,
            db,
            started: Instant::now(),
        }
    }
}

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let database = match &state.db {
        Some(db) => match sqlx::query_scalar::<_, bool>("SELECT true")
            .fetch_one(&db.pool)
            .await
        {
            Ok(_) => "connected",
            Err(_) => "disconnected",
        },
        None => "not configured",
    };

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: database.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    });
    Ok(HttpResponse::Ok().json(response))
}

/// Acknowledge immediately; the runs execute on a background task and are
/// observable through the execution listing.
pub async fn trigger_migrations(
    payload: web::Json<MigrationTriggerRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let kinds = match parse_kinds(&payload.types) {
        Ok(kinds) => kinds,
        Err(msg) => {
            tracing::warn!(types = ?payload.types, error = %msg, "rejected migration trigger");
            return Ok(HttpResponse::BadRequest().json(ApiResponse::error(msg)));
        }
    };
    tracing::info!(?kinds, "migration trigger accepted");

    let syncer = state.syncer.clone();
    let spawned = kinds.clone();
    actix_web::rt::spawn(async move {
        if let Err(err) = syncer.trigger(&spawned).await {
            tracing::error!(error = %format!("{err:#}"), "triggered sync could not record its runs");
        }
    });

    let accepted: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    Ok(HttpResponse::Accepted().json(ApiResponse::success(serde_json::json!({
        "accepted": accepted,
    }))))
}

pub async fn list_migrations(
    query: web::Query<ExecutionsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    match state.syncer.runs().list(limit).await {
        Ok((executions, count)) => {
            Ok(HttpResponse::Ok().json(ExecutionsResponse { executions, count }))
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "listing runs failed");
            Ok(HttpResponse::InternalServerError().json(ApiResponse::error("could not list runs")))
        }
    }
}
