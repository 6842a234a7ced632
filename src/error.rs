//! Error taxonomy for the forecast pipeline.
//!
//! Every failure a run can hit maps onto one of these variants and is
//! returned inside a `RunResult`; nothing here is meant to unwind into the
//! scheduler. Startup code in `main.rs` uses `anyhow` instead.

use serde::Serialize;
use thiserror::Error;

use crate::models::HorizonKind;

// ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    /// The reading store could not be reached. Retried on the next tick.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Not enough history to fit a model. Retried once more data accumulates.
    #[error("insufficient data: need at least {required} days of history, got {available}")]
    InsufficientData { available: usize, required: usize },

    /// Model fitting or prediction failed.
    #[error("forecaster failure: {0}")]
    ForecasterFailure(String),

    /// A single forecast record could not be written.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("a {0} run is already in progress")]
    RunInProgress(HorizonKind),

    #[error("run timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Machine-readable error category, serialized next to the reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreUnavailable,
    InsufficientData,
    ForecasterFailure,
    PersistenceFailure,
    RunInProgress,
    Timeout,
    InvalidInput,
}

impl ForecastError {
    // ---
    pub fn kind(&self) -> ErrorKind {
        // ---
        match self {
            ForecastError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            ForecastError::InsufficientData { .. } => ErrorKind::InsufficientData,
            ForecastError::ForecasterFailure(_) => ErrorKind::ForecasterFailure,
            ForecastError::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            ForecastError::RunInProgress(_) => ErrorKind::RunInProgress,
            ForecastError::Timeout(_) => ErrorKind::Timeout,
            ForecastError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether the next scheduled tick may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForecastError::StoreUnavailable(_)
                | ForecastError::RunInProgress(_)
                | ForecastError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
