//! Capacity clamp for raw model output.
//!
//! Predictions are bounded to `[0, limit]` where
//! `limit = min(max(history) * multiplier, hard_cap)`. The clamp is total:
//! empty history falls back to the hard cap and non-finite predictions are
//! treated as zero output.

use serde::{Deserialize, Serialize};

// ---

/// Clamp parameters for one horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampSettings {
    /// Headroom applied to the largest value seen in training.
    pub multiplier: f64,
    /// Fixed plant ceiling in MWh per period.
    pub hard_cap: f64,
}

impl Default for ClampSettings {
    fn default() -> Self {
        ClampSettings {
            multiplier: 1.2,
            hard_cap: 4000.0,
        }
    }
}

/// Output of [`apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Clamped {
    pub values: Vec<f64>,
    pub limit: f64,
    /// Number of predictions that were moved to a bound.
    pub clipped: usize,
}

/// Upper bound for a prediction given the training history.
pub fn capacity_limit(history: &[f64], settings: &ClampSettings) -> f64 {
    // ---
    let observed_max = history
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .reduce(f64::max);

    let limit = match observed_max {
        Some(max) => (max * settings.multiplier).min(settings.hard_cap),
        None => settings.hard_cap,
    };
    limit.max(0.0)
}

/// Clip every prediction into `[0, limit]`.
///
/// Logs a warning when anything was clipped so a drifting plant ceiling
/// shows up in operator logs.
pub fn apply(predictions: &[f64], history: &[f64], settings: &ClampSettings) -> Clamped {
    // ---
    let limit = capacity_limit(history, settings);
    let mut clipped = 0;

    let values = predictions
        .iter()
        .map(|&raw| {
            let bounded = if raw.is_finite() {
                raw.clamp(0.0, limit)
            } else {
                0.0
            };
            if bounded != raw {
                clipped += 1;
            }
            bounded
        })
        .collect();

    if clipped > 0 {
        tracing::warn!(
            clipped,
            total = predictions.len(),
            limit,
            hard_cap = settings.hard_cap,
            "Predictions exceeded the plant limit and were clipped"
        );
    }

    Clamped {
        values,
        limit,
        clipped,
    }
}
