//! HTTP handlers
//!
//! POST /api/matching/runs, GET /api/matching/runs/:id,
//! GET /api/matching/runs/:id/exceptions, GET /api/organizations/:org/matching/runs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{MatchingConfig, ThresholdOverrides};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{ExceptionView, MatchingRun, MatchingSummary};
use crate::AppState;

const DEFAULT_RUN_LIST_LIMIT: i64 = 20;
const MAX_RUN_LIST_LIMIT: i64 = 500;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    Json(HealthResponse {
        status: "ok".to_string(),
        module: "tms-mr".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
    })
}

/// POST /api/matching/runs request
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub organization_id: String,
    #[serde(flatten)]
    pub overrides: ThresholdOverrides,
}

/// POST /api/matching/runs
///
/// Responds once the run completes. The run itself is a spawned task, so a
/// client that disconnects early does not leave it stuck in `running`. 409
/// while another run of the same organization is active.
pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<MatchingSummary>)> {
    if request.organization_id.trim().is_empty() {
        return Err(ApiError::BadRequest("organization_id is required".to_string()));
    }

    let config = MatchingConfig::resolve(
        &state.db,
        &request.organization_id,
        &request.overrides,
        &state.matching_defaults,
    )
    .await?;

    let engine = state.engine.clone();
    let summary = tokio::spawn(async move { engine.run_matching(&config).await })
        .await
        .map_err(|e| ApiError::Internal(format!("Matching run task failed: {}", e)))??;

    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /api/matching/runs/:id
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<MatchingRun>> {
    let run = db::get_run(&state.db, &run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Matching run {}", run_id)))?;

    Ok(Json(run))
}

/// GET /api/matching/runs/:id/exceptions
pub async fn list_run_exceptions(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<ExceptionView>>> {
    if db::get_run(&state.db, &run_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Matching run {}", run_id)));
    }

    Ok(Json(db::list_exceptions(&state.db, &run_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
}

/// GET /api/organizations/:org/matching/runs?limit=N
pub async fn list_org_runs(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<MatchingRun>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIST_LIMIT);
    if !(1..=MAX_RUN_LIST_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_RUN_LIST_LIMIT
        )));
    }

    Ok(Json(db::list_runs(&state.db, &organization_id, limit).await?))
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub fn matching_routes() -> Router<AppState> {
    Router::new()
        .route("/api/matching/runs", post(start_run))
        .route("/api/matching/runs/:id", get(get_run))
        .route("/api/matching/runs/:id/exceptions", get(list_run_exceptions))
        .route("/api/organizations/:org/matching/runs", get(list_org_runs))
}
