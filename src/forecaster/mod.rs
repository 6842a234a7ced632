//! Forecasting models behind a common interface.
//!
//! A [`Forecaster`] turns a clean daily training series into one value per
//! requested future day. Which model serves which horizon is decided once,
//! in [`ForecasterRegistry`], never inside a run.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::NaiveDate;

use crate::{
    config::PipelineConfig,
    error::{ForecastError, Result},
    models::{HorizonKind, WeatherFeatures},
};

mod seasonal;
mod weather_regression;

pub use seasonal::SeasonalForecaster;
pub use weather_regression::WeatherRegression;

// ---

/// One day of training history.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub features: Option<WeatherFeatures>,
}

/// A day to forecast and whatever weather inputs were ingested for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureInput {
    pub date: NaiveDate,
    pub features: Option<WeatherFeatures>,
}

/// Gap-free, ascending daily history plus the days to forecast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSeries {
    pub points: Vec<TrainingPoint>,
    pub future: Vec<FutureInput>,
}

impl TrainingSeries {
    // ---
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    /// Shared precondition check for model implementations.
    pub(crate) fn check(&self, horizon: usize, min_points: usize) -> Result<()> {
        // ---
        if self.points.len() < min_points {
            return Err(ForecastError::InsufficientData {
                available: self.points.len(),
                required: min_points,
            });
        }
        if self.future.len() != horizon {
            return Err(ForecastError::ForecasterFailure(format!(
                "expected {horizon} future days, got {}",
                self.future.len()
            )));
        }
        Ok(())
    }
}

/// Fit on a training series and predict `horizon` future values.
///
/// Implementations are pure: no I/O, and identical input gives the same
/// output up to optimizer tolerance.
pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    /// Returns exactly `horizon` values, one per entry of `series.future`.
    fn fit_predict(&self, series: &TrainingSeries, horizon: usize) -> Result<Vec<f64>>;
}

/// Horizon → model lookup table.
#[derive(Clone, Default)]
pub struct ForecasterRegistry {
    models: HashMap<HorizonKind, Arc<dyn Forecaster>>,
}

impl ForecasterRegistry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Weather regression for next-day, seasonal decomposition for seven-day.
    pub fn standard(config: &PipelineConfig) -> Self {
        // ---
        Self::new()
            .with(
                HorizonKind::NextDay,
                WeatherRegression::new(config.next_day.min_training_days as usize)
                    .with_lambda(config.ridge_lambda),
            )
            .with(
                HorizonKind::SevenDay,
                SeasonalForecaster::weekly(config.seven_day.min_training_days as usize),
            )
    }

    pub fn with<F>(mut self, horizon: HorizonKind, forecaster: F) -> Self
    where
        F: Forecaster + 'static,
    {
        self.models.insert(horizon, Arc::new(forecaster));
        self
    }

    pub fn get(&self, horizon: HorizonKind) -> Result<Arc<dyn Forecaster>> {
        // ---
        self.models.get(&horizon).cloned().ok_or_else(|| {
            ForecastError::ForecasterFailure(format!("no forecaster registered for {horizon}"))
        })
    }
}

impl fmt::Debug for ForecasterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (h, m) in &self.models {
            map.entry(h, &m.name());
        }
        map.finish()
    }
}
