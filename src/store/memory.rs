//! In-process store used by tests and local experiments.
//!
//! All state sits behind one `tokio::sync::RwLock`, which gives the
//! per-key write serialization the trait requires. Two fault switches let
//! tests simulate an unreachable store and single failing forecast writes.

use std::{
    collections::{BTreeMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::sync::RwLock;

use super::{ActualRule, Coverage, ReadingStore, ReadingTotals};
use crate::{
    accuracy::Metrics,
    error::{ForecastError, Result},
    models::{ForecastKey, ForecastRecord, HorizonKind, Reading},
};

// ---

#[derive(Debug, Default)]
struct State {
    readings: BTreeMap<DateTime<Utc>, Reading>,
    forecasts: BTreeMap<ForecastKey, ForecastRecord>,
    rejected: HashSet<ForecastKey>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes of the forecast record with `key` fail.
    pub async fn reject_forecast_writes(&self, key: ForecastKey) {
        self.state.write().await.rejected.insert(key);
    }

    pub async fn reading_count(&self) -> usize {
        self.state.read().await.readings.len()
    }

    fn check_available(&self) -> Result<()> {
        // ---
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ForecastError::StoreUnavailable(
                "memory store switched offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    // ---
    async fn upsert(&self, reading: &Reading) -> Result<()> {
        // ---
        self.check_available()?;
        self.state
            .write()
            .await
            .readings
            .insert(reading.measured_at, reading.clone());
        Ok(())
    }

    async fn read_series(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>> {
        // ---
        self.check_available()?;
        if from >= to {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state.readings.range(from..to).map(|(_, r)| r.clone()).collect())
    }

    async fn read_actual(
        &self,
        rule: ActualRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // ---
        self.check_available()?;
        if from >= to {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(rule.aggregate(state.readings.range(from..to).map(|(_, r)| r)))
    }

    async fn read_coverage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Coverage> {
        // ---
        self.check_available()?;
        if from >= to {
            return Ok(Coverage::default());
        }
        let state = self.state.read().await;
        let range = state.readings.range(from..to);
        Ok(Coverage {
            readings: range.clone().count(),
            last_at: range.last().map(|(at, _)| *at),
        })
    }

    async fn read_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tz: Tz,
    ) -> Result<ReadingTotals> {
        // ---
        self.check_available()?;
        if from >= to {
            return Ok(ReadingTotals::default());
        }
        let state = self.state.read().await;

        let mut days: BTreeMap<NaiveDate, Vec<&Reading>> = BTreeMap::new();
        for r in state.readings.range(from..to).map(|(_, r)| r) {
            days.entry(r.measured_at.with_timezone(&tz).date_naive())
                .or_default()
                .push(r);
        }
        let readings: Vec<&Reading> = days.values().flatten().copied().collect();

        let total_mwh = days
            .values()
            .filter_map(|rs| ActualRule::CounterDelta.aggregate(rs.iter().copied()))
            .fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v));

        Ok(ReadingTotals {
            readings: readings.len(),
            total_mwh,
            avg_irradiance_wm2: mean(readings.iter().filter_map(|r| r.forecast_irradiance_wm2)),
            avg_temperature_c: mean(readings.iter().filter_map(|r| r.forecast_temperature_c)),
        })
    }

    async fn upsert_forecast(&self, record: &ForecastRecord) -> Result<()> {
        // ---
        self.check_available()?;
        let mut state = self.state.write().await;
        let key = record.key();
        if state.rejected.contains(&key) {
            return Err(ForecastError::PersistenceFailure(format!(
                "write rejected for {key}"
            )));
        }
        state.forecasts.insert(key, record.clone());
        Ok(())
    }

    async fn reconcile_forecast(
        &self,
        key: &ForecastKey,
        actual_mwh: f64,
        metrics: &Metrics,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        // ---
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.rejected.contains(key) {
            return Err(ForecastError::PersistenceFailure(format!(
                "write rejected for {key}"
            )));
        }
        match state.forecasts.get_mut(key) {
            Some(record) if !record.is_reconciled() => {
                record.attach_actual(actual_mwh, metrics, at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_forecasts(
        &self,
        horizon: HorizonKind,
        before: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        // ---
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .forecasts
            .values()
            .filter(|r| r.horizon == horizon && !r.is_reconciled() && r.forecast_end < before)
            .cloned()
            .collect())
    }

    async fn read_forecasts(
        &self,
        horizon: HorizonKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        // ---
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .forecasts
            .values()
            .filter(|r| r.horizon == horizon && r.forecast_start >= from && r.forecast_end <= to)
            .cloned()
            .collect())
    }

    async fn count_forecasts(&self, horizon: HorizonKind) -> Result<usize> {
        // ---
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.forecasts.keys().filter(|k| k.horizon == horizon).count())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    // ---
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}
