//! Next-day model driven by exogenous weather forecasts.
//!
//! Ridge regression of daily output on forecast irradiance, temperature,
//! wind speed and a day-of-year encoding. Columns are standardized before
//! fitting and the intercept is left unpenalized.

use chrono::{Datelike, NaiveDate};

use super::{Forecaster, TrainingSeries};
use crate::{
    error::{ForecastError, Result},
    models::WeatherFeatures,
};

// ---

const FEATURES: usize = 5;
const DEFAULT_LAMBDA: f64 = 0.1;
const PIVOT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct WeatherRegression {
    min_points: usize,
    lambda: f64,
}

impl WeatherRegression {
    // ---
    pub fn new(min_points: usize) -> Self {
        WeatherRegression {
            min_points,
            lambda: DEFAULT_LAMBDA,
        }
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda.max(0.0);
        self
    }
}

fn design(features: &WeatherFeatures, date: NaiveDate) -> [f64; FEATURES] {
    // ---
    let angle = std::f64::consts::TAU * f64::from(date.ordinal0()) / 365.25;
    [
        features.irradiance_wm2,
        features.temperature_c,
        features.wind_speed_ms,
        angle.sin(),
        angle.cos(),
    ]
}

#[derive(Debug, Clone)]
struct Fitted {
    means: [f64; FEATURES],
    scales: [f64; FEATURES],
    coef: [f64; FEATURES],
    intercept: f64,
}

impl Fitted {
    fn predict(&self, x: &[f64; FEATURES]) -> f64 {
        // ---
        (0..FEATURES).fold(self.intercept, |acc, j| {
            acc + self.coef[j] * (x[j] - self.means[j]) / self.scales[j]
        })
    }
}

fn fit(rows: &[([f64; FEATURES], f64)], lambda: f64) -> Result<Fitted> {
    // ---
    let n = rows.len() as f64;

    let mut means = [0.0; FEATURES];
    for (x, _) in rows {
        for j in 0..FEATURES {
            means[j] += x[j] / n;
        }
    }

    let mut scales = [0.0; FEATURES];
    for (x, _) in rows {
        for j in 0..FEATURES {
            scales[j] += (x[j] - means[j]).powi(2) / n;
        }
    }
    for s in scales.iter_mut() {
        *s = if *s > PIVOT_EPSILON { s.sqrt() } else { 1.0 };
    }

    let y_mean = rows.iter().map(|(_, y)| y).sum::<f64>() / n;

    // Normal equations on standardized columns: (ZᵀZ + λI) β = Zᵀ(y - ȳ)
    let mut a = [[0.0; FEATURES]; FEATURES];
    let mut b = [0.0; FEATURES];
    for (x, y) in rows {
        let z: Vec<f64> = (0..FEATURES).map(|j| (x[j] - means[j]) / scales[j]).collect();
        for i in 0..FEATURES {
            b[i] += z[i] * (y - y_mean);
            for j in 0..FEATURES {
                a[i][j] += z[i] * z[j];
            }
        }
    }
    for (i, row) in a.iter_mut().enumerate() {
        row[i] += lambda;
    }

    let coef = solve(a, b)?;
    Ok(Fitted {
        means,
        scales,
        coef,
        intercept: y_mean,
    })
}

/// Gaussian elimination with partial pivoting.
fn solve(
    mut a: [[f64; FEATURES]; FEATURES],
    mut b: [f64; FEATURES],
) -> Result<[f64; FEATURES]> {
    // ---
    for col in 0..FEATURES {
        let pivot = (col..FEATURES)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(ForecastError::ForecasterFailure(
                "weather regression design matrix is singular".to_string(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..FEATURES {
            let factor = a[row][col] / a[col][col];
            for k in col..FEATURES {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; FEATURES];
    for row in (0..FEATURES).rev() {
        let tail: f64 = (row + 1..FEATURES).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

impl Forecaster for WeatherRegression {
    // ---
    fn name(&self) -> &str {
        "weather_regression"
    }

    fn fit_predict(&self, series: &TrainingSeries, horizon: usize) -> Result<Vec<f64>> {
        // ---
        series.check(horizon, self.min_points)?;

        let rows: Vec<([f64; FEATURES], f64)> = series
            .points
            .iter()
            .filter_map(|p| p.features.map(|f| (design(&f, p.date), p.value)))
            .collect();

        let required = self.min_points.max(FEATURES + 1);
        if rows.len() < required {
            return Err(ForecastError::InsufficientData {
                available: rows.len(),
                required,
            });
        }

        let model = fit(&rows, self.lambda)?;
        let last_known = series.points.iter().rev().find_map(|p| p.features);

        series
            .future
            .iter()
            .map(|input| {
                let features = match input.features {
                    Some(f) => f,
                    None => {
                        tracing::warn!(
                            date = %input.date,
                            "No weather forecast ingested for target day, reusing latest features"
                        );
                        last_known.ok_or_else(|| {
                            ForecastError::ForecasterFailure(
                                "no weather features available".to_string(),
                            )
                        })?
                    }
                };
                Ok(model.predict(&design(&features, input.date)))
            })
            .collect()
    }
}
