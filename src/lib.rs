//! Forecast orchestration for a solar generation facility.
//!
//! Readings are ingested into a [`store::ReadingStore`]; the
//! [`pipeline::ForecastService`] fits a per-horizon [`forecaster::Forecaster`],
//! clamps the output to plant limits, persists one record per forecast day
//! and later reconciles each record with its realized output. The
//! [`scheduler`] fires runs at fixed local times and [`routes`] exposes the
//! same operations over HTTP.
//!
//! Module boundaries follow EMBP: each module exports a narrow surface and
//! `main.rs` is the only place that wires concrete implementations together.

pub mod accuracy;
pub mod clamp;
pub mod clock;
pub mod config;
pub mod error;
pub mod forecaster;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use config::{Config, HorizonSettings, PipelineConfig};
pub use error::{ForecastError, Result};
pub use models::{ForecastRecord, HorizonKind, Reading};
pub use pipeline::{ForecastService, RunResult, RunStatus};
