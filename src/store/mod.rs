//! Reading and forecast storage.
//!
//! The pipeline only talks to the [`ReadingStore`] trait. `PgStore` is the
//! production backend; `MemoryStore` keeps everything in process and backs
//! the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

use crate::{
    accuracy::Metrics,
    error::Result,
    models::{ForecastKey, ForecastRecord, HorizonKind, Reading},
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// How the realized output of a period is derived from raw readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActualRule {
    /// `max - min` of the cumulative energy counter.
    CounterDelta,
    /// Sum of instantaneous power over the local daylight hours
    /// `first_hour..=last_hour` (hourly readings, so MW sums to MWh).
    DaylightSum {
        first_hour: u32,
        last_hour: u32,
        tz: Tz,
    },
}

impl ActualRule {
    /// Aggregate `readings` (already restricted to the period) under this rule.
    ///
    /// Returns `None` when no reading carries the field the rule needs.
    pub fn aggregate<'a, I>(&self, readings: I) -> Option<f64>
    where
        I: IntoIterator<Item = &'a Reading>,
    {
        // ---
        match *self {
            ActualRule::CounterDelta => {
                let (min, max) = readings
                    .into_iter()
                    .filter_map(|r| r.cumulative_mwh)
                    .filter(|v| v.is_finite())
                    .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                        None => Some((v, v)),
                    })?;
                Some(max - min)
            }
            ActualRule::DaylightSum {
                first_hour,
                last_hour,
                tz,
            } => readings
                .into_iter()
                .filter(|r| {
                    let hour = r.measured_at.with_timezone(&tz).hour();
                    (first_hour..=last_hour).contains(&hour)
                })
                .filter_map(|r| r.power_mw)
                .fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v)),
        }
    }
}

/// How much raw data a time range holds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coverage {
    pub readings: usize,
    pub last_at: Option<DateTime<Utc>>,
}

impl Coverage {
    /// Whether the data reaches into the final hour before `to` and holds
    /// at least `min_readings` rows.
    ///
    /// A period still being back-filled fails this check, so its actual is
    /// not frozen from a partial day.
    pub fn is_complete(&self, to: DateTime<Utc>, min_readings: usize) -> bool {
        // ---
        let reaches_end = self
            .last_at
            .is_some_and(|last| last >= to - Duration::hours(1));
        reaches_end && self.readings >= min_readings
    }
}

/// Aggregates of the readings in a range, see [`ReadingStore::read_totals`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadingTotals {
    pub readings: usize,
    /// Sum over local days of each day's counter delta.
    pub total_mwh: Option<f64>,
    pub avg_irradiance_wm2: Option<f64>,
    pub avg_temperature_c: Option<f64>,
}

/// Storage contract consumed by the forecast pipeline.
///
/// Reading upserts are last-write-wins per `measured_at`; forecast upserts
/// replace by [`ForecastKey`]. Implementations must serialize concurrent
/// writes to the same key.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Insert or overwrite the reading at `reading.measured_at`.
    async fn upsert(&self, reading: &Reading) -> Result<()>;

    /// Readings with `from <= measured_at < to`, ascending. Gaps are not filled.
    async fn read_series(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>>;

    /// Realized output over `[from, to)` under `rule`, if any data exists.
    async fn read_actual(
        &self,
        rule: ActualRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    /// Row count and latest timestamp of the readings in `[from, to)`.
    async fn read_coverage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Coverage>;

    /// Energy and weather aggregates of the readings in `[from, to)`, with
    /// counter deltas taken per local day in `tz`.
    async fn read_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tz: Tz,
    ) -> Result<ReadingTotals>;

    /// Insert or replace the forecast record with the same key.
    async fn upsert_forecast(&self, record: &ForecastRecord) -> Result<()>;

    /// Fill in the realized value of a pending record.
    ///
    /// Only applies while the stored `actual_mwh` is null; returns whether a
    /// record was updated.
    async fn reconcile_forecast(
        &self,
        key: &ForecastKey,
        actual_mwh: f64,
        metrics: &Metrics,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Unreconciled records of `horizon` whose period ended before `before`.
    async fn pending_forecasts(
        &self,
        horizon: HorizonKind,
        before: NaiveDate,
    ) -> Result<Vec<ForecastRecord>>;

    /// Records with `forecast_start >= from` and `forecast_end <= to`, ascending.
    async fn read_forecasts(
        &self,
        horizon: HorizonKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ForecastRecord>>;

    async fn count_forecasts(&self, horizon: HorizonKind) -> Result<usize>;
}
