//! Read-only status API over the store. JSON only; any dashboard UI lives
//! outside this process.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::runner::current_session_date;
use crate::store::Database;

#[derive(Clone)]
pub struct AppState {
    pub store: Database,
    pub dry_run: bool,
    pub tz_offset_hours: i32,
    pub wake_hour: u32,
    pub sleep_hour: u32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/trades", get(trades_handler))
        .route("/api/signals", get(signals_handler))
        .route("/api/exit-params", get(exit_params_handler))
        .route("/api/report/:date", get(report_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /api/stats
async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let date = current_session_date(state.tz_offset_hours, state.wake_hour, state.sleep_hour);
    state
        .store
        .get_stats(date)
        .map(|stats| {
            Json(json!({
                "dry_run": state.dry_run,
                "session_date": date.to_string(),
                "stats": stats,
            }))
        })
        .map_err(internal_error)
}

/// GET /api/trades
async fn trades_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .store
        .list_recent_trades(50)
        .map(Json)
        .map_err(internal_error)
}

/// GET /api/signals
async fn signals_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .store
        .list_recent_signals(50)
        .map(Json)
        .map_err(internal_error)
}

/// GET /api/exit-params
async fn exit_params_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .store
        .load_exit_params()
        .map(|loaded| match loaded {
            Some((params, reason)) => Json(json!({ "params": params, "reason": reason })),
            None => Json(json!({
                "params": crate::store::models::ExitParams::default(),
                "reason": "defaults",
            })),
        })
        .map_err(internal_error)
}

/// GET /api/report/:date
async fn report_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let date: NaiveDate = date
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "expected YYYY-MM-DD".to_string()))?;
    match state.store.load_session_report(date) {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("no report for {}", date))),
        Err(e) => Err(internal_error(e)),
    }
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
