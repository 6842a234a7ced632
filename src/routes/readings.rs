//! Reading ingestion and listing.
//!
//! `POST /readings` upserts a JSON array of readings (last write wins per
//! `measured_at`); `GET /readings?start=&end=` lists the stored rows in
//! `[start, end)`; `GET /readings/summary?type=day|month|year&date=`
//! aggregates one calendar period.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ApiError, AppState};
use crate::{
    error::ForecastError,
    models::{Reading, ReadingSummary, SummaryPeriod},
};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", get(list).post(ingest))
        .route("/readings/summary", get(summary))
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    upserted: usize,
}

async fn ingest(
    State(service): State<AppState>,
    Json(readings): Json<Vec<Reading>>,
) -> Result<Json<IngestResponse>, ApiError> {
    // ---
    info!("POST /readings - {} readings", readings.len());

    let upserted = service.ingest(&readings).await?;
    Ok(Json(IngestResponse { upserted }))
}

/// Query parameters for listing readings.
#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn list(
    State(service): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    // ---
    debug!("GET /readings - {:?}", params);

    let readings = service.readings(params.start, params.end).await?;
    debug!("GET /readings - returning {} readings", readings.len());
    Ok(Json(readings))
}

/// Query parameters for a period summary.
#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(rename = "type")]
    period: String,
    date: NaiveDate,
}

async fn summary(
    State(service): State<AppState>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<ReadingSummary>, ApiError> {
    // ---
    debug!("GET /readings/summary - {:?}", params);

    let period = params
        .period
        .parse::<SummaryPeriod>()
        .map_err(ForecastError::InvalidInput)?;
    let summary = service.summary(period, params.date).await?;
    Ok(Json(summary))
}
