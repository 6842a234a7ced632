//! Forecast table, accuracy and manual triggers.
//!
//! - `GET  /forecast/{horizon}?start=&end=`          persisted records
//! - `GET  /forecast/{horizon}/accuracy?start=&end=` batch metrics
//! - `POST /forecast/{horizon}/run`                   run the pipeline now
//! - `POST /forecast/{horizon}/reconcile`             fill in pending actuals
//!
//! A manual run goes through the same `run_forecast` the scheduler uses.
//! Date ranges default to the last 30 days through the next 7.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Days, NaiveDate};
use serde::Deserialize;
use tracing::{debug, info};

use super::{status_for, ApiError, AppState};
use crate::{
    models::{ForecastRecord, HorizonKind},
    pipeline::{AccuracyReport, ReconcileSummary},
};

// ---

const DEFAULT_LOOKBACK_DAYS: u64 = 30;
const DEFAULT_LOOKAHEAD_DAYS: u64 = 7;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/forecast/{horizon}", get(list))
        .route("/forecast/{horizon}/accuracy", get(accuracy))
        .route("/forecast/{horizon}/run", post(run))
        .route("/forecast/{horizon}/reconcile", post(reconcile))
}

/// Inclusive date range filter; either bound may be omitted.
#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl RangeQuery {
    fn resolve(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        // ---
        let start = self.start.unwrap_or_else(|| {
            today
                .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
                .unwrap_or(today)
        });
        let end = self.end.unwrap_or_else(|| {
            today
                .checked_add_days(Days::new(DEFAULT_LOOKAHEAD_DAYS))
                .unwrap_or(today)
        });
        (start, end)
    }
}

async fn list(
    State(service): State<AppState>,
    Path(horizon): Path<HorizonKind>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<ForecastRecord>>, ApiError> {
    // ---
    let (start, end) = range.resolve(service.today());
    debug!("GET /forecast/{} - {}..={}", horizon, start, end);

    let records = service.forecasts(horizon, start, end).await?;
    Ok(Json(records))
}

async fn accuracy(
    State(service): State<AppState>,
    Path(horizon): Path<HorizonKind>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<AccuracyReport>, ApiError> {
    // ---
    let (start, end) = range.resolve(service.today());
    debug!("GET /forecast/{}/accuracy - {}..={}", horizon, start, end);

    let report = service.accuracy(horizon, start, end).await?;
    Ok(Json(report))
}

async fn run(State(service): State<AppState>, Path(horizon): Path<HorizonKind>) -> Response {
    // ---
    info!("POST /forecast/{}/run - manual trigger", horizon);

    let result = service.run_forecast(horizon).await;
    let status = result.error_kind.map(status_for).unwrap_or(StatusCode::OK);
    (status, Json(result)).into_response()
}

async fn reconcile(
    State(service): State<AppState>,
    Path(horizon): Path<HorizonKind>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    // ---
    info!("POST /forecast/{}/reconcile - manual trigger", horizon);

    let summary = service.reconcile(horizon).await?;
    Ok(Json(summary))
}
