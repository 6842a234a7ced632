// src/routes/health.rs
//! API health check endpoint for the solarcast service.
//!
//! This module defines the `/health` route used by container orchestrators
//! and CI pipelines to verify that the service is up and answering HTTP
//! requests. Like its siblings it follows the Explicit Module Boundary
//! Pattern (EMBP): the handler stays private, the gateway (`mod.rs`) only
//! sees the subrouter.

use axum::{routing::get, Json, Router};
use serde::Serialize;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Handle `GET /health`.
///
/// Does not touch the store; a database outage shows up as `503` on the
/// data endpoints instead.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create a subrouter containing the `/health` route.
///
/// Generic over the application state so it merges into the gateway router
/// regardless of the state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
