//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::state::AppState;
use crate::alert;
use crate::coordinator::{RunError, RunTrigger};
use crate::scheduler::{self, history};
use crate::trend::{history as trend_history, TrendSummary};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/trends/latest", get(latest_trends))
        .route("/trends/summary", get(trend_summary))
        .route("/trends/history/{entity}", get(entity_history))
        .route("/alerts", get(list_alerts))
        .route("/runs", get(list_runs).post(trigger_run))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Error body in the same envelope as successful responses.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        warn!(error = %format!("{:#}", err), "api request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        Self {
            status: run_error_status(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "data": null,
            "meta": { "error": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

fn run_error_status(err: &RunError) -> StatusCode {
    match err {
        RunError::RunLockConflict => StatusCode::CONFLICT,
        RunError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "run_in_progress": state.engine.is_running()
        }),
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }),
    )
}

async fn latest_trends(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let trends = trend_history::latest_ranking(&state.pool, q.limit()).map_err(ApiError::internal)?;
    let total = trends.len();
    Ok(envelope(json!(trends), json!({ "total": total, "limit": q.limit() })))
}

async fn trend_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let ranking =
        trend_history::latest_ranking(&state.pool, u32::MAX as usize).map_err(ApiError::internal)?;
    let config = state.engine.config();
    let summary =
        TrendSummary::from_ranking(&ranking, config.soft_threshold, config.hard_threshold);
    Ok(envelope(
        json!(summary),
        json!({
            "soft_threshold": config.soft_threshold,
            "hard_threshold": config.hard_threshold
        }),
    ))
}

async fn entity_history(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let scores = trend_history::entity_history(&state.pool, &entity, q.limit())
        .map_err(ApiError::internal)?;
    let total = scores.len();
    Ok(envelope(
        json!(scores),
        json!({ "entity": entity, "total": total, "alert_state": state.engine.alerts().state(&entity) }),
    ))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let alerts = alert::list_alerts(&state.pool, q.limit()).map_err(ApiError::internal)?;
    let total = alerts.len();
    Ok(envelope(json!(alerts), json!({ "total": total })))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = history::list_runs(&state.pool, q.limit()).map_err(ApiError::internal)?;
    let total = runs.len();
    Ok(envelope(json!(runs), json!({ "total": total })))
}

async fn trigger_run(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report =
        scheduler::run_scheduled(&state.engine, state.items_path.as_deref(), RunTrigger::Api)
            .await?;
    Ok(envelope(json!(report), json!({ "status": report.status })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RunPhase;
    use std::time::Duration;

    #[test]
    fn test_run_error_status_mapping() {
        assert_eq!(
            run_error_status(&RunError::RunLockConflict),
            StatusCode::CONFLICT
        );
        assert_eq!(
            run_error_status(&RunError::Timeout {
                limit: Duration::from_secs(1),
                phase: RunPhase::Alert,
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            run_error_status(&RunError::Worker("panicked".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(LimitQuery { limit: None }.limit(), DEFAULT_LIMIT);
        assert_eq!(LimitQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(LimitQuery { limit: Some(10_000) }.limit(), MAX_LIMIT);
    }
}
