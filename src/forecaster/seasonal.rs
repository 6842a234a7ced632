//! Seven-day model driven purely by the historical series.
//!
//! With at least two full seasons of history the series is decomposed with
//! MSTL (weekly period) and the trend is forecast with AutoETS; shorter
//! series fall back to non-seasonal AutoETS.

use augurs::{
    ets::AutoETS,
    forecaster::{transforms::LinearInterpolator, Forecaster as AugursForecaster, Transformer},
    mstl::MSTLModel,
};

use super::{Forecaster, TrainingSeries};
use crate::error::{ForecastError, Result};

// ---

const WEEKLY_PERIOD: usize = 7;
const INTERVAL_LEVEL: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct SeasonalForecaster {
    period: usize,
    min_points: usize,
}

impl SeasonalForecaster {
    // ---
    pub fn new(period: usize, min_points: usize) -> Self {
        SeasonalForecaster {
            period: period.max(2),
            min_points,
        }
    }

    pub fn weekly(min_points: usize) -> Self {
        Self::new(WEEKLY_PERIOD, min_points)
    }

    fn predict_steps(&self, values: &[f64], steps: usize) -> Result<Vec<f64>> {
        // ---
        let transformers: Vec<Box<dyn Transformer>> = vec![Box::new(LinearInterpolator::default())];

        let forecast = if values.len() >= 2 * self.period {
            let trend = AutoETS::non_seasonal().into_trend_model();
            let mstl = MSTLModel::new(vec![self.period], trend);
            let mut model = AugursForecaster::new(mstl).with_transformers(transformers);
            model
                .fit(values)
                .map_err(|e| ForecastError::ForecasterFailure(format!("MSTL fit error: {e}")))?;
            model
                .predict(steps, INTERVAL_LEVEL)
                .map_err(|e| ForecastError::ForecasterFailure(format!("MSTL predict error: {e}")))?
        } else {
            let ets = AutoETS::non_seasonal();
            let mut model = AugursForecaster::new(ets).with_transformers(transformers);
            model
                .fit(values)
                .map_err(|e| ForecastError::ForecasterFailure(format!("ETS fit error: {e}")))?;
            model
                .predict(steps, INTERVAL_LEVEL)
                .map_err(|e| ForecastError::ForecasterFailure(format!("ETS predict error: {e}")))?
        };

        if forecast.point.len() < steps {
            return Err(ForecastError::ForecasterFailure(format!(
                "model returned {} points for {steps} steps",
                forecast.point.len()
            )));
        }
        Ok(forecast.point)
    }
}

impl Forecaster for SeasonalForecaster {
    // ---
    fn name(&self) -> &str {
        "mstl_ets"
    }

    fn fit_predict(&self, series: &TrainingSeries, horizon: usize) -> Result<Vec<f64>> {
        // ---
        series.check(horizon, self.min_points.max(1))?;
        let last = series
            .last_date()
            .ok_or_else(|| ForecastError::ForecasterFailure("empty training series".to_string()))?;

        // Target days need not start right after the history ends
        let steps: Vec<usize> = series
            .future
            .iter()
            .map(|f| {
                let ahead = (f.date - last).num_days();
                usize::try_from(ahead).ok().filter(|s| *s >= 1).ok_or_else(|| {
                    ForecastError::ForecasterFailure(format!(
                        "target day {} is not after training end {last}",
                        f.date
                    ))
                })
            })
            .collect::<Result<_>>()?;

        let max_step = steps.iter().copied().max().unwrap_or(1);
        let points = self.predict_steps(&series.values(), max_step)?;

        Ok(steps.into_iter().map(|s| points[s - 1]).collect())
    }
}
