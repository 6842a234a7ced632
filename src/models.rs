//! Data models for the forecast pipeline.
//!
//! `Reading` is the normalized ingestion record, `ForecastRecord` is one row
//! of the persisted forecast table. Both serialize to the JSON shapes served
//! by the `routes` gateway.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::accuracy::Metrics;

// ---

/// Forecast lead time and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonKind {
    /// The single day after the run date.
    NextDay,
    /// Seven days starting on the run date.
    SevenDay,
}

impl HorizonKind {
    // ---
    pub const ALL: [HorizonKind; 2] = [HorizonKind::NextDay, HorizonKind::SevenDay];

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            HorizonKind::NextDay => "next_day",
            HorizonKind::SevenDay => "seven_day",
        }
    }

    /// Offset in days between the run date and the first forecasted day.
    pub fn lead_days(self) -> u64 {
        // ---
        match self {
            HorizonKind::NextDay => 1,
            HorizonKind::SevenDay => 0,
        }
    }

    /// Local calendar days covered by a run on `today`.
    pub fn target_periods(self, today: NaiveDate, horizon_days: u32) -> Vec<ForecastPeriod> {
        // ---
        (0..u64::from(horizon_days))
            .filter_map(|i| today.checked_add_days(Days::new(self.lead_days() + i)))
            .map(ForecastPeriod::day)
            .collect()
    }
}

impl fmt::Display for HorizonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HorizonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "next_day" => Ok(HorizonKind::NextDay),
            "seven_day" => Ok(HorizonKind::SevenDay),
            other => Err(format!("unknown horizon '{other}'")),
        }
    }
}

/// One timestamped measurement row, as delivered by the ingestion feed.
///
/// Every field except `measured_at` is nullable: weather adapters write the
/// forecast inputs ahead of time and the plant meter fills in production
/// values later, both through upserts on the same timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub measured_at: DateTime<Utc>,
    pub cumulative_mwh: Option<f64>,
    pub power_mw: Option<f64>,
    pub forecast_irradiance_wm2: Option<f64>,
    pub forecast_temperature_c: Option<f64>,
    pub forecast_wind_speed_ms: Option<f64>,
}

impl Reading {
    // ---
    pub fn at(measured_at: DateTime<Utc>) -> Self {
        // ---
        Reading {
            measured_at,
            cumulative_mwh: None,
            power_mw: None,
            forecast_irradiance_wm2: None,
            forecast_temperature_c: None,
            forecast_wind_speed_ms: None,
        }
    }
}

/// Exogenous weather inputs for one forecast day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherFeatures {
    pub irradiance_wm2: f64,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
}

impl WeatherFeatures {
    /// Collapse a day's readings into one feature row, taking the first
    /// non-null value of each field. `None` unless all three are present.
    pub fn from_readings<'a, I>(readings: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Reading>,
    {
        // ---
        let (mut irradiance, mut temperature, mut wind) = (None, None, None);
        for r in readings {
            irradiance = irradiance.or(r.forecast_irradiance_wm2);
            temperature = temperature.or(r.forecast_temperature_c);
            wind = wind.or(r.forecast_wind_speed_ms);
        }

        Some(WeatherFeatures {
            irradiance_wm2: irradiance?,
            temperature_c: temperature?,
            wind_speed_ms: wind?,
        })
    }
}

/// Inclusive range of local calendar days a forecast value covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ForecastPeriod {
    // ---
    pub fn day(date: NaiveDate) -> Self {
        ForecastPeriod {
            start: date,
            end: date,
        }
    }

    /// UTC bounds `[start, end)` of the period in the facility timezone.
    pub fn bounds(&self, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        // ---
        let after_end = self.end.succ_opt().unwrap_or(self.end);
        (local_day_start(tz, self.start), local_day_start(tz, after_end))
    }

    /// Number of local days covered.
    pub fn days(&self) -> usize {
        ((self.end - self.start).num_days() + 1).max(1) as usize
    }

    /// Whether the whole period lies before `now`.
    pub fn has_elapsed(&self, tz: Tz, now: DateTime<Utc>) -> bool {
        self.bounds(tz).1 <= now
    }
}

/// First instant of `date` in `tz`, expressed in UTC.
///
/// Zones that skip local midnight on a DST switch start the day at the
/// first valid instant after it.
pub fn local_day_start(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    // ---
    let midnight = date.and_time(NaiveTime::MIN);
    (0..3)
        .find_map(|h| {
            tz.from_local_datetime(&(midnight + chrono::Duration::hours(h)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

/// Calendar granularity of a reading summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryPeriod {
    Day,
    Month,
    Year,
}

impl SummaryPeriod {
    /// Local days `[first, after_last)` of the day, month or year holding `date`.
    pub fn range(self, date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        // ---
        let first = match self {
            SummaryPeriod::Day => date,
            SummaryPeriod::Month => date.with_day(1)?,
            SummaryPeriod::Year => date.with_ordinal(1)?,
        };
        let after_last = match self {
            SummaryPeriod::Day => first.checked_add_days(Days::new(1))?,
            SummaryPeriod::Month => first.checked_add_months(Months::new(1))?,
            SummaryPeriod::Year => first.checked_add_months(Months::new(12))?,
        };
        Some((first, after_last))
    }

    /// Label of the period holding `date`: `2025-05-01`, `2025-05` or `2025`.
    pub fn label(self, date: NaiveDate) -> String {
        // ---
        match self {
            SummaryPeriod::Day => date.format("%Y-%m-%d").to_string(),
            SummaryPeriod::Month => date.format("%Y-%m").to_string(),
            SummaryPeriod::Year => date.format("%Y").to_string(),
        }
    }
}

impl FromStr for SummaryPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "day" | "daily" => Ok(SummaryPeriod::Day),
            "month" | "monthly" => Ok(SummaryPeriod::Month),
            "year" | "yearly" => Ok(SummaryPeriod::Year),
            other => Err(format!("unknown summary type '{other}'")),
        }
    }
}

/// Produced energy and average weather inputs over one calendar period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingSummary {
    pub period: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub readings: usize,
    pub total_mwh: f64,
    pub avg_irradiance_wm2: Option<f64>,
    pub avg_temperature_c: Option<f64>,
}

/// Storage key of a forecast record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ForecastKey {
    pub horizon: HorizonKind,
    pub forecast_start: NaiveDate,
}

impl fmt::Display for ForecastKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.horizon, self.forecast_start)
    }
}

/// One persisted prediction and, once known, its realized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    // ---
    pub horizon: HorizonKind,
    pub forecast_start: NaiveDate,
    pub forecast_end: NaiveDate,
    pub predicted_mwh: f64,
    pub actual_mwh: Option<f64>,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub mape: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl ForecastRecord {
    // ---
    pub fn predicted(
        horizon: HorizonKind,
        period: ForecastPeriod,
        predicted_mwh: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        // ---
        ForecastRecord {
            horizon,
            forecast_start: period.start,
            forecast_end: period.end,
            predicted_mwh,
            actual_mwh: None,
            rmse: None,
            mae: None,
            mape: None,
            created_at,
            reconciled_at: None,
        }
    }

    pub fn key(&self) -> ForecastKey {
        ForecastKey {
            horizon: self.horizon,
            forecast_start: self.forecast_start,
        }
    }

    pub fn period(&self) -> ForecastPeriod {
        ForecastPeriod {
            start: self.forecast_start,
            end: self.forecast_end,
        }
    }

    /// Attach the realized value and its accuracy metrics.
    pub fn attach_actual(&mut self, actual_mwh: f64, metrics: &Metrics, at: DateTime<Utc>) {
        // ---
        self.actual_mwh = Some(actual_mwh);
        self.rmse = finite(metrics.rmse);
        self.mae = finite(metrics.mae);
        self.mape = finite(metrics.mape);
        self.reconciled_at = Some(at);
    }

    pub fn is_reconciled(&self) -> bool {
        self.actual_mwh.is_some()
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}
