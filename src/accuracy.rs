//! Forecast accuracy metrics (RMSE, MAE, MAPE).
//!
//! MAPE is reported in percent with a guarded denominator,
//! `max(|actual|, epsilon)`. For batches, points whose actual falls below
//! `min_actual` are left out of the MAPE average only; a batch where every
//! point is left out reports MAPE as `NaN`.

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracySettings {
    pub epsilon: f64,
    pub min_actual: f64,
}

impl Default for AccuracySettings {
    fn default() -> Self {
        AccuracySettings {
            epsilon: 1e-6,
            min_actual: 1e-6,
        }
    }
}

/// Accuracy of one point or one batch. Undefined values are `NaN`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyEvaluator {
    settings: AccuracySettings,
}

impl AccuracyEvaluator {
    // ---
    pub fn new(settings: AccuracySettings) -> Self {
        AccuracyEvaluator { settings }
    }

    /// Metrics for a single `(actual, predicted)` pair.
    pub fn score(&self, actual: f64, predicted: f64) -> Metrics {
        // ---
        let abs_err = (actual - predicted).abs();
        Metrics {
            rmse: abs_err,
            mae: abs_err,
            mape: self.percentage_error(actual, predicted),
        }
    }

    /// Metrics for order-aligned batches of actuals and predictions.
    pub fn score_series(&self, actuals: &[f64], predicteds: &[f64]) -> Result<Metrics> {
        // ---
        if actuals.len() != predicteds.len() {
            return Err(ForecastError::InvalidInput(format!(
                "actuals ({}) and predictions ({}) differ in length",
                actuals.len(),
                predicteds.len()
            )));
        }

        if actuals.is_empty() {
            return Ok(Metrics {
                rmse: f64::NAN,
                mae: f64::NAN,
                mape: f64::NAN,
            });
        }

        let n = actuals.len() as f64;
        let pairs = || actuals.iter().copied().zip(predicteds.iter().copied());

        let mse = pairs().map(|(a, p)| (a - p).powi(2)).sum::<f64>() / n;
        let mae = pairs().map(|(a, p)| (a - p).abs()).sum::<f64>() / n;

        let kept: Vec<f64> = pairs()
            .filter(|(a, _)| a.abs() >= self.settings.min_actual)
            .map(|(a, p)| self.percentage_error(a, p))
            .collect();
        let mape = if kept.is_empty() {
            f64::NAN
        } else {
            kept.iter().sum::<f64>() / kept.len() as f64
        };

        Ok(Metrics {
            rmse: mse.sqrt(),
            mae,
            mape,
        })
    }

    fn percentage_error(&self, actual: f64, predicted: f64) -> f64 {
        let denom = actual.abs().max(self.settings.epsilon);
        (actual - predicted).abs() / denom * 100.0
    }
}
