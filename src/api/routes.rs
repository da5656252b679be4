use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::checker::{AlertChecker, CycleOutcome};
use crate::error::AppError;
use crate::store::AlertStore;
use crate::types::{Alert, NewAlert, Server, StoreType};

#[derive(Clone)]
pub struct ApiState {
    pub store: AlertStore,
    pub checker: Arc<AlertChecker>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/alerts", get(get_alerts).post(post_alert))
        .route("/alerts/:id", delete(delete_alert))
        .route("/stats/engine", get(get_engine_stats))
        .route("/check", post(post_force_check))
        .route("/cache/clear", post(post_clear_cache))
        .route("/restart", post(post_restart))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub alerts: i64,
    /// Unix ms of the last completed cycle, if any.
    pub last_global_check: Option<i64>,
}

#[derive(Serialize)]
pub struct EngineStatsResponse {
    pub tracked_groups: usize,
    pub cached_entries: usize,
    #[serde(flatten)]
    pub counters: crate::api::stats::StatsSnapshot,
}

/// Body for alert creation, typically issued by the bot's command layer.
#[derive(Deserialize)]
pub struct CreateAlertRequest {
    pub user_id: String,
    pub search_term: String,
    pub server: Server,
    pub store_type: StoreType,
    pub max_price: Option<i64>,
    pub min_quantity: Option<i64>,
}

#[derive(Serialize)]
pub struct ForceCheckResponse {
    pub outcome: &'static str,
    pub groups: Option<usize>,
    pub notified: Option<usize>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok",
        alerts: state.store.count().await?,
        last_global_check: state.store.last_global_check().await?,
    }))
}

async fn get_alerts(State(state): State<ApiState>) -> Result<Json<Vec<Alert>>, AppError> {
    Ok(Json(state.store.list_all().await?))
}

async fn post_alert(
    State(state): State<ApiState>,
    Json(req): Json<CreateAlertRequest>,
) -> Result<(StatusCode, Json<Alert>), AppError> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let alert = state
        .store
        .create(
            NewAlert {
                user_id: req.user_id,
                search_term: req.search_term,
                server: req.server,
                store_type: req.store_type,
                max_price: req.max_price,
                min_quantity: req.min_quantity,
            },
            now_ms,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn delete_alert(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.store.remove(id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn get_engine_stats(State(state): State<ApiState>) -> Json<EngineStatsResponse> {
    let (tracked_groups, cached_entries) = state.checker.strategy_snapshot();
    Json(EngineStatsResponse {
        tracked_groups,
        cached_entries,
        counters: state.checker.stats().snapshot(),
    })
}

async fn post_force_check(
    State(state): State<ApiState>,
) -> Result<Json<ForceCheckResponse>, AppError> {
    let resp = match state.checker.force_check().await? {
        CycleOutcome::AlreadyRunning => ForceCheckResponse {
            outcome: "already_running",
            groups: None,
            notified: None,
        },
        CycleOutcome::NoAlerts => ForceCheckResponse {
            outcome: "no_alerts",
            groups: Some(0),
            notified: Some(0),
        },
        CycleOutcome::Completed(s) => ForceCheckResponse {
            outcome: "completed",
            groups: Some(s.groups),
            notified: Some(s.notified),
        },
    };
    Ok(Json(resp))
}

async fn post_clear_cache(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.checker.clear_cache();
    Json(serde_json::json!({ "status": "cleared" }))
}

/// Re-read configuration from the environment and resume polling without
/// the warm-up delay.
async fn post_restart(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, AppError> {
    state.checker.restart()?;
    Ok(Json(serde_json::json!({ "status": "restarted" })))
}
