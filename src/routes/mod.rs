//! HTTP gateway for the forecast service (EMBP).
//!
//! Sibling modules each export a subrouter; this gateway merges them and
//! attaches the shared [`ForecastService`] as state. Error-to-status mapping
//! lives here so every endpoint reports failures the same way.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::{
    error::{ErrorKind, ForecastError},
    pipeline::ForecastService,
};

mod forecast;
mod health;
mod readings;

// ---

pub type AppState = Arc<ForecastService>;

pub fn router(service: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(forecast::router())
        .merge(health::router())
        .with_state(service)
}

/// HTTP status reported for a failure of kind `kind`.
fn status_for(kind: ErrorKind) -> StatusCode {
    // ---
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientData => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RunInProgress => StatusCode::CONFLICT,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ForecasterFailure | ErrorKind::PersistenceFailure => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

/// Handler error wrapper rendering `{ "error", "kind" }` with a mapped status.
struct ApiError(ForecastError);

impl From<ForecastError> for ApiError {
    fn from(e: ForecastError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let kind = self.0.kind();
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status_for(kind), Json(body)).into_response()
    }
}
