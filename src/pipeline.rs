//! Forecast orchestration for one horizon at a time.
//!
//! [`ForecastService`] is the explicit run context: store handle, pipeline
//! configuration, clock, model registry and the per-horizon run locks. It is
//! constructed once in `main.rs` and shared (behind an `Arc`) by the
//! scheduler and the HTTP trigger, so both go through the same
//! [`ForecastService::run_forecast`].
//!
//! A run walks `LoadTraining → Predict → Clamp → Reconcile → Persist → Done`.
//! Every failure is caught at the run boundary and returned inside a
//! [`RunResult`]; nothing before `Persist` writes to the store.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    accuracy::{AccuracyEvaluator, Metrics},
    clamp,
    clock::Clock,
    config::PipelineConfig,
    error::{ErrorKind, ForecastError, Result},
    forecaster::{ForecasterRegistry, FutureInput, TrainingPoint, TrainingSeries},
    models::{
        local_day_start, ForecastPeriod, ForecastRecord, HorizonKind, Reading, ReadingSummary,
        SummaryPeriod, WeatherFeatures,
    },
    store::{ActualRule, ReadingStore},
};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    LoadTraining,
    Predict,
    Clamp,
    Reconcile,
    Persist,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Failed,
}

/// Outcome of one forecast run, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    // ---
    pub run_id: Uuid,
    pub horizon: HorizonKind,
    pub status: RunStatus,

    /// Last stage entered; `Done` on success, the failing stage otherwise.
    pub stage: RunStage,

    /// Records written by this run. On a per-record persistence failure this
    /// is the subset that made it.
    pub records: Vec<ForecastRecord>,

    /// Older pending records filled in by the post-persist sweep.
    pub reconciled: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Outcome of one reconciliation pass over pending records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    /// Pending records whose period ended before today.
    pub checked: usize,
    pub reconciled: usize,
    /// Records whose actual has not been ingested yet.
    pub still_pending: usize,
    /// Records whose update could not be written.
    pub failed: usize,
}

/// Rolling accuracy over the reconciled records of a date range.
#[derive(Debug, Clone, Serialize)]
pub struct AccuracyReport {
    pub horizon: HorizonKind,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Reconciled records that entered the metrics.
    pub count: usize,
    pub metrics: Metrics,
}

/// One exclusive lock per horizon.
#[derive(Debug, Default)]
struct HorizonLocks {
    next_day: Arc<Mutex<()>>,
    seven_day: Arc<Mutex<()>>,
}

impl HorizonLocks {
    // ---
    fn get(&self, horizon: HorizonKind) -> Arc<Mutex<()>> {
        match horizon {
            HorizonKind::NextDay => self.next_day.clone(),
            HorizonKind::SevenDay => self.seven_day.clone(),
        }
    }

    fn try_acquire(&self, horizon: HorizonKind) -> Result<OwnedMutexGuard<()>> {
        self.get(horizon)
            .try_lock_owned()
            .map_err(|_| ForecastError::RunInProgress(horizon))
    }
}

/// Mutable bookkeeping of a run in flight, readable after a timeout.
#[derive(Debug)]
struct RunProgress {
    stage: RunStage,
    records: Vec<ForecastRecord>,
    reconciled: usize,
}

impl Default for RunProgress {
    fn default() -> Self {
        RunProgress {
            stage: RunStage::LoadTraining,
            records: Vec::new(),
            reconciled: 0,
        }
    }
}

pub struct ForecastService {
    store: Arc<dyn ReadingStore>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    forecasters: ForecasterRegistry,
    evaluator: AccuracyEvaluator,
    locks: HorizonLocks,
}

impl ForecastService {
    // ---
    pub fn new(
        store: Arc<dyn ReadingStore>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        forecasters: ForecasterRegistry,
    ) -> Self {
        // ---
        let evaluator = AccuracyEvaluator::new(config.accuracy);
        ForecastService {
            store,
            config,
            clock,
            forecasters,
            evaluator,
            locks: HorizonLocks::default(),
        }
    }

    /// Local calendar date at the facility.
    pub fn today(&self) -> NaiveDate {
        self.clock
            .now()
            .with_timezone(&self.config.timezone)
            .date_naive()
    }

    // --- ingestion and read access

    /// Upsert a batch of readings; returns how many were written.
    pub async fn ingest(&self, readings: &[Reading]) -> Result<usize> {
        // ---
        for reading in readings {
            self.store.upsert(reading).await?;
        }
        tracing::debug!(count = readings.len(), "Readings upserted");
        Ok(readings.len())
    }

    pub async fn readings(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>> {
        // ---
        if from > to {
            return Err(ForecastError::InvalidInput(format!(
                "start {from} is after end {to}"
            )));
        }
        self.store.read_series(from, to).await
    }

    pub async fn forecasts(
        &self,
        horizon: HorizonKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        // ---
        if from > to {
            return Err(ForecastError::InvalidInput(format!(
                "start {from} is after end {to}"
            )));
        }
        self.store.read_forecasts(horizon, from, to).await
    }

    /// Produced energy and mean weather inputs over the local day, month or
    /// year holding `date`. An empty period reports zero energy.
    pub async fn summary(&self, period: SummaryPeriod, date: NaiveDate) -> Result<ReadingSummary> {
        // ---
        let tz = self.config.timezone;
        let (first, after_last) = period
            .range(date)
            .ok_or_else(|| ForecastError::InvalidInput(format!("date {date} out of range")))?;

        let totals = self
            .store
            .read_totals(local_day_start(tz, first), local_day_start(tz, after_last), tz)
            .await?;

        Ok(ReadingSummary {
            period: period.label(date),
            from: first,
            to: after_last.pred_opt().unwrap_or(first),
            readings: totals.readings,
            total_mwh: totals.total_mwh.unwrap_or(0.0),
            avg_irradiance_wm2: totals.avg_irradiance_wm2,
            avg_temperature_c: totals.avg_temperature_c,
        })
    }

    /// Batch accuracy of the reconciled records in `[from, to]`.
    pub async fn accuracy(
        &self,
        horizon: HorizonKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<AccuracyReport> {
        // ---
        let records = self.forecasts(horizon, from, to).await?;
        let (actuals, predicted): (Vec<f64>, Vec<f64>) = records
            .iter()
            .filter_map(|r| r.actual_mwh.map(|a| (a, r.predicted_mwh)))
            .unzip();
        let metrics = self.evaluator.score_series(&actuals, &predicted)?;

        Ok(AccuracyReport {
            horizon,
            from,
            to,
            count: actuals.len(),
            metrics,
        })
    }

    // --- runs

    /// Run the full pipeline for `horizon`.
    ///
    /// Never fails: every error ends up in the returned [`RunResult`]. A run
    /// already in flight for the same horizon makes this one fail fast with
    /// `RunInProgress`.
    pub async fn run_forecast(&self, horizon: HorizonKind) -> RunResult {
        // ---
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("forecast_run", %run_id, %horizon);

        async move {
            let started_at = self.clock.now();
            let mut progress = RunProgress::default();

            let outcome = match self.locks.try_acquire(horizon) {
                Err(e) => Err(e),
                Ok(_guard) => {
                    tracing::info!("Forecast run started");
                    let timeout = self.config.run_timeout;
                    match tokio::time::timeout(timeout, self.execute(horizon, &mut progress)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ForecastError::Timeout(timeout_ms(timeout))),
                    }
                }
            };

            let result = RunResult {
                run_id,
                horizon,
                status: RunStatus::Done,
                stage: progress.stage,
                records: progress.records,
                reconciled: progress.reconciled,
                error: None,
                error_kind: None,
                started_at,
                finished_at: self.clock.now(),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        records = result.records.len(),
                        reconciled = result.reconciled,
                        "Forecast run completed"
                    );
                    result
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(stage = ?result.stage, error = %e, "Forecast run failed");
                    } else {
                        tracing::error!(stage = ?result.stage, error = %e, "Forecast run failed");
                    }
                    RunResult {
                        status: RunStatus::Failed,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                        ..result
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fill in actuals for pending records of `horizon` whose period has
    /// ended. Takes the horizon lock, so it never overlaps a run.
    pub async fn reconcile(&self, horizon: HorizonKind) -> Result<ReconcileSummary> {
        // ---
        let span = tracing::info_span!("reconcile", %horizon);
        self.reconcile_locked(horizon).instrument(span).await
    }

    async fn reconcile_locked(&self, horizon: HorizonKind) -> Result<ReconcileSummary> {
        // ---
        let _guard = self.locks.try_acquire(horizon)?;
        let timeout = self.config.run_timeout;
        let summary = tokio::time::timeout(timeout, self.sweep(horizon))
            .await
            .map_err(|_| ForecastError::Timeout(timeout_ms(timeout)))??;

        tracing::info!(
            checked = summary.checked,
            reconciled = summary.reconciled,
            still_pending = summary.still_pending,
            failed = summary.failed,
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    async fn execute(&self, horizon: HorizonKind, progress: &mut RunProgress) -> Result<()> {
        // ---
        let settings = self.config.horizon(horizon);
        let tz = self.config.timezone;
        let rule = self.config.actual_rule(horizon);
        let now = self.clock.now();
        let today = now.with_timezone(&tz).date_naive();
        let periods = horizon.target_periods(today, settings.horizon_days);

        progress.stage = RunStage::LoadTraining;
        let series = self.load_training(horizon, today, &periods).await?;
        let history = series.values();
        tracing::debug!(
            days = series.points.len(),
            first = ?series.points.first().map(|p| p.date),
            last = ?series.last_date(),
            "Training window loaded"
        );

        progress.stage = RunStage::Predict;
        let forecaster = self.forecasters.get(horizon)?;
        let steps = periods.len();
        let model = forecaster.name().to_string();
        let raw = tokio::task::spawn_blocking(move || forecaster.fit_predict(&series, steps))
            .await
            .map_err(|e| ForecastError::ForecasterFailure(format!("{model} task failed: {e}")))??;
        if raw.len() != steps {
            return Err(ForecastError::ForecasterFailure(format!(
                "{model} returned {} values for {steps} periods",
                raw.len()
            )));
        }
        tracing::debug!(%model, ?raw, "Raw predictions");

        progress.stage = RunStage::Clamp;
        let clamped = clamp::apply(&raw, &history, &settings.clamp);

        progress.stage = RunStage::Reconcile;
        let mut records = Vec::with_capacity(steps);
        for (period, predicted) in periods.iter().zip(clamped.values) {
            let mut record = ForecastRecord::predicted(horizon, *period, predicted, now);
            if let Some(actual) = self.actual_if_elapsed(rule, period, now).await? {
                let metrics = self.evaluator.score(actual, predicted);
                record.attach_actual(actual, &metrics, now);
            }
            records.push(record);
        }

        progress.stage = RunStage::Persist;
        let mut failures = Vec::new();
        for record in records {
            match self.store.upsert_forecast(&record).await {
                Ok(()) => progress.records.push(record),
                Err(e) => {
                    tracing::warn!(key = %record.key(), error = %e, "Forecast record not persisted");
                    failures.push(e.to_string());
                }
            }
        }

        // Older records may have become reconcilable since the last pass
        match self.sweep(horizon).await {
            Ok(summary) => progress.reconciled = summary.reconciled,
            Err(e) => tracing::warn!(error = %e, "Reconciliation sweep skipped"),
        }

        if !failures.is_empty() {
            return Err(ForecastError::PersistenceFailure(failures.join("; ")));
        }

        progress.stage = RunStage::Done;
        Ok(())
    }

    /// Build the gap-free daily training series that ends before `today`,
    /// plus the weather inputs already ingested for the target periods.
    async fn load_training(
        &self,
        horizon: HorizonKind,
        today: NaiveDate,
        periods: &[ForecastPeriod],
    ) -> Result<TrainingSeries> {
        // ---
        let settings = self.config.horizon(horizon);
        let tz = self.config.timezone;
        let rule = self.config.actual_rule(horizon);

        let window_end = local_day_start(tz, today);
        let window_start = match settings.training_days {
            0 => DateTime::<Utc>::UNIX_EPOCH,
            n => today
                .checked_sub_days(Days::new(u64::from(n)))
                .map(|d| local_day_start(tz, d))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        };
        let read_end = periods
            .last()
            .map(|p| p.bounds(tz).1)
            .unwrap_or(window_end)
            .max(window_end);

        let readings = self.store.read_series(window_start, read_end).await?;

        let mut days: BTreeMap<NaiveDate, Vec<&Reading>> = BTreeMap::new();
        for r in &readings {
            days.entry(r.measured_at.with_timezone(&tz).date_naive())
                .or_default()
                .push(r);
        }
        let features: BTreeMap<NaiveDate, WeatherFeatures> = days
            .iter()
            .filter_map(|(d, rs)| WeatherFeatures::from_readings(rs.iter().copied()).map(|f| (*d, f)))
            .collect();

        let observed: Vec<TrainingPoint> = days
            .range(..today)
            .filter_map(|(date, rs)| {
                rule.aggregate(rs.iter().copied())
                    .filter(|v| v.is_finite())
                    .map(|value| TrainingPoint {
                        date: *date,
                        value,
                        features: features.get(date).copied(),
                    })
            })
            .collect();

        let required = settings.min_training_days as usize;
        if observed.len() < required {
            return Err(ForecastError::InsufficientData {
                available: observed.len(),
                required,
            });
        }

        let future = periods
            .iter()
            .map(|p| FutureInput {
                date: p.start,
                features: features.get(&p.start).copied(),
            })
            .collect();

        Ok(TrainingSeries {
            points: fill_gaps(observed, &features),
            future,
        })
    }

    /// Realized value of `period`, once it has fully elapsed and its
    /// readings look complete.
    ///
    /// A record is reconciled at most once, so a day still being back-filled
    /// stays pending instead of freezing a partial actual.
    async fn actual_if_elapsed(
        &self,
        rule: ActualRule,
        period: &ForecastPeriod,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // ---
        let tz = self.config.timezone;
        if !period.has_elapsed(tz, now) {
            return Ok(None);
        }
        let (from, to) = period.bounds(tz);

        let coverage = self.store.read_coverage(from, to).await?;
        let min_readings = self.config.actual_min_readings as usize * period.days();
        if !coverage.is_complete(to, min_readings) {
            tracing::debug!(
                start = %period.start,
                readings = coverage.readings,
                last_at = ?coverage.last_at,
                "Period readings incomplete, actual deferred"
            );
            return Ok(None);
        }

        Ok(self
            .store
            .read_actual(rule, from, to)
            .await?
            .filter(|v| v.is_finite()))
    }

    /// Reconcile every pending record of `horizon` that ended before today.
    async fn sweep(&self, horizon: HorizonKind) -> Result<ReconcileSummary> {
        // ---
        let now = self.clock.now();
        let today = now.with_timezone(&self.config.timezone).date_naive();
        let rule = self.config.actual_rule(horizon);

        let pending = self.store.pending_forecasts(horizon, today).await?;
        let mut summary = ReconcileSummary {
            checked: pending.len(),
            ..Default::default()
        };

        for record in pending {
            let Some(actual) = self.actual_if_elapsed(rule, &record.period(), now).await? else {
                summary.still_pending += 1;
                continue;
            };
            let metrics = self.evaluator.score(actual, record.predicted_mwh);
            match self
                .store
                .reconcile_forecast(&record.key(), actual, &metrics, now)
                .await
            {
                Ok(true) => {
                    tracing::debug!(key = %record.key(), actual, predicted = record.predicted_mwh, "Forecast reconciled");
                    summary.reconciled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %record.key(), error = %e, "Reconciliation write failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Insert linearly interpolated values for interior missing days.
///
/// `points` must be ascending by date with at most one entry per day.
/// Filled days take their weather features from `features` when present.
fn fill_gaps(
    points: Vec<TrainingPoint>,
    features: &BTreeMap<NaiveDate, WeatherFeatures>,
) -> Vec<TrainingPoint> {
    // ---
    let mut out: Vec<TrainingPoint> = Vec::with_capacity(points.len());
    for point in points {
        if let Some(prev) = out.last().cloned() {
            let gap = (point.date - prev.date).num_days();
            for k in 1..gap {
                let Some(date) = prev.date.checked_add_days(Days::new(k as u64)) else {
                    break;
                };
                let value = prev.value + (point.value - prev.value) * k as f64 / gap as f64;
                out.push(TrainingPoint {
                    date,
                    value,
                    features: features.get(&date).copied(),
                });
            }
        }
        out.push(point);
    }
    out
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        clock::FixedClock,
        forecaster::Forecaster,
        models::ForecastKey,
        store::MemoryStore,
    };
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};
    use chrono_tz::Tz;

    const TZ: Tz = chrono_tz::Asia::Seoul;

    struct Constant(f64);

    impl Forecaster for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn fit_predict(&self, series: &TrainingSeries, horizon: usize) -> Result<Vec<f64>> {
            series.check(horizon, 1)?;
            Ok(vec![self.0; horizon])
        }
    }

    struct Failing;

    impl Forecaster for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn fit_predict(&self, _series: &TrainingSeries, _horizon: usize) -> Result<Vec<f64>> {
            Err(ForecastError::ForecasterFailure("optimizer diverged".into()))
        }
    }

    struct Slow(std::time::Duration);

    impl Forecaster for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn fit_predict(&self, _series: &TrainingSeries, horizon: usize) -> Result<Vec<f64>> {
            std::thread::sleep(self.0);
            Ok(vec![1.0; horizon])
        }
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    /// 10:00 local time on `day`.
    fn local_morning(day: NaiveDate) -> DateTime<Utc> {
        TZ.from_local_datetime(&day.and_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap()))
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Hourly readings for each day in `[first, first + days)`. Day `i`
    /// produces `daily(i)` MWh under both actual rules.
    async fn seed(store: &MemoryStore, first: NaiveDate, days: u64, daily: impl Fn(u64) -> f64) {
        // ---
        let mut counter = 1_000.0;
        for i in 0..days {
            let day = first + Days::new(i);
            let energy = daily(i);
            let start = local_day_start(TZ, day);
            for h in 0..24u32 {
                let mut r = Reading::at(start + ChronoDuration::hours(i64::from(h)));
                r.cumulative_mwh = Some(counter + energy * f64::from(h) / 23.0);
                r.power_mw = Some(if (7..=20).contains(&h) { energy / 14.0 } else { 0.0 });
                r.forecast_irradiance_wm2 = Some(400.0 + i as f64);
                r.forecast_temperature_c = Some(20.0);
                r.forecast_wind_speed_ms = Some(3.0);
                store.upsert(&r).await.unwrap();
            }
            counter += energy;
        }
    }

    fn service(
        store: Arc<MemoryStore>,
        registry: ForecasterRegistry,
        config: PipelineConfig,
        now: DateTime<Utc>,
    ) -> (ForecastService, Arc<FixedClock>) {
        // ---
        let clock = Arc::new(FixedClock::new(now));
        let svc = ForecastService::new(store, config, clock.clone(), registry);
        (svc, clock)
    }

    fn constant_registry(value: f64) -> ForecasterRegistry {
        ForecasterRegistry::new()
            .with(HorizonKind::NextDay, Constant(value))
            .with(HorizonKind::SevenDay, Constant(value))
    }

    #[tokio::test]
    async fn test_insufficient_history_writes_nothing() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 17), 3, |_| 100.0).await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::NextDay).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage, RunStage::LoadTraining);
        assert_eq!(result.error_kind, Some(ErrorKind::InsufficientData));
        assert!(result.error.unwrap().contains("got 3"));
        assert!(result.records.is_empty());
        assert_eq!(store.count_forecasts(HorizonKind::NextDay).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_day_run_persists_clamped_tomorrow() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |i| 100.0 + i as f64).await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(500.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::NextDay).await;

        assert!(result.is_done(), "{:?}", result.error);
        assert_eq!(result.stage, RunStage::Done);
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.forecast_start, date(6, 21));
        assert_eq!(record.forecast_end, date(6, 21));
        // max(history) = 109, limit = 109 * 1.2
        assert!((record.predicted_mwh - 130.8).abs() < 1e-9);
        assert_eq!(record.actual_mwh, None);
    }

    #[tokio::test]
    async fn test_seven_day_run_covers_today_onwards() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 1), 19, |_| 120.0).await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::SevenDay).await;

        assert!(result.is_done(), "{:?}", result.error);
        let starts: Vec<NaiveDate> = result.records.iter().map(|r| r.forecast_start).collect();
        let expected: Vec<NaiveDate> = (20..27).map(|d| date(6, d)).collect();
        assert_eq!(starts, expected);
        assert!(result.records.iter().all(|r| r.predicted_mwh == 100.0));
    }

    #[tokio::test]
    async fn test_rerun_replaces_records() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 1), 19, |_| 120.0).await;
        let (svc, clock) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        assert!(svc.run_forecast(HorizonKind::SevenDay).await.is_done());
        assert_eq!(store.count_forecasts(HorizonKind::SevenDay).await.unwrap(), 7);

        clock.advance(ChronoDuration::hours(1));
        let second = svc.run_forecast(HorizonKind::SevenDay).await;
        assert!(second.is_done());
        assert_eq!(store.count_forecasts(HorizonKind::SevenDay).await.unwrap(), 7);

        let stored = svc
            .forecasts(HorizonKind::SevenDay, date(6, 20), date(6, 26))
            .await
            .unwrap();
        assert!(stored.iter().all(|r| r.created_at == second.started_at));
    }

    #[tokio::test]
    async fn test_reconciliation_round_trip() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let (svc, clock) = service(
            store.clone(),
            constant_registry(110.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let run = svc.run_forecast(HorizonKind::NextDay).await;
        assert!(run.is_done());
        let predicted = run.records[0].predicted_mwh;

        // Nothing to reconcile while tomorrow has not happened
        let early = svc.reconcile(HorizonKind::NextDay).await.unwrap();
        assert_eq!(early.checked, 0);

        seed(&store, date(6, 20), 2, |_| 95.0).await;
        clock.set(local_morning(date(6, 22)));

        let summary = svc.reconcile(HorizonKind::NextDay).await.unwrap();
        assert_eq!(summary.reconciled, 1);

        let stored = svc
            .forecasts(HorizonKind::NextDay, date(6, 21), date(6, 21))
            .await
            .unwrap();
        let record = &stored[0];
        assert_eq!(record.predicted_mwh, predicted);
        assert!((record.actual_mwh.unwrap() - 95.0).abs() < 1e-9);
        assert!((record.mae.unwrap() - (predicted - 95.0).abs()).abs() < 1e-9);
        assert_eq!(record.rmse, record.mae);
        assert!(record.mape.is_some());
        assert!(record.reconciled_at.is_some());

        // A second pass finds nothing left to do
        let again = svc.reconcile(HorizonKind::NextDay).await.unwrap();
        assert_eq!(again, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn test_partial_day_stays_pending_until_backfilled() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let (svc, clock) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );
        assert!(svc.run_forecast(HorizonKind::NextDay).await.is_done());

        // Counter grows 4 MWh per hour, 92 MWh over the full day
        let start = local_day_start(TZ, date(6, 21));
        let hour = |h: u32| {
            let mut r = Reading::at(start + ChronoDuration::hours(i64::from(h)));
            r.cumulative_mwh = Some(5_000.0 + 4.0 * f64::from(h));
            r
        };

        for h in 0..3 {
            store.upsert(&hour(h)).await.unwrap();
        }
        clock.set(local_morning(date(6, 22)));

        let first = svc.reconcile(HorizonKind::NextDay).await.unwrap();
        assert_eq!(first.checked, 1);
        assert_eq!(first.reconciled, 0);
        assert_eq!(first.still_pending, 1);

        for h in 3..24 {
            store.upsert(&hour(h)).await.unwrap();
        }

        let second = svc.reconcile(HorizonKind::NextDay).await.unwrap();
        assert_eq!(second.reconciled, 1);

        let stored = svc
            .forecasts(HorizonKind::NextDay, date(6, 21), date(6, 21))
            .await
            .unwrap();
        assert_eq!(stored[0].actual_mwh, Some(92.0));
    }

    #[tokio::test]
    async fn test_run_sweeps_older_pending_records() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let (svc, clock) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        assert!(svc.run_forecast(HorizonKind::NextDay).await.is_done());

        seed(&store, date(6, 20), 2, |_| 90.0).await;
        clock.set(local_morning(date(6, 22)));

        let next = svc.run_forecast(HorizonKind::NextDay).await;
        assert!(next.is_done());
        assert_eq!(next.reconciled, 1);
        assert_eq!(next.records[0].forecast_start, date(6, 23));
    }

    #[tokio::test]
    async fn test_one_rejected_record_does_not_block_others() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 1), 19, |_| 120.0).await;
        store
            .reject_forecast_writes(ForecastKey {
                horizon: HorizonKind::SevenDay,
                forecast_start: date(6, 22),
            })
            .await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::SevenDay).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage, RunStage::Persist);
        assert_eq!(result.error_kind, Some(ErrorKind::PersistenceFailure));
        assert_eq!(result.records.len(), 6);
        assert!(result.records.iter().all(|r| r.forecast_start != date(6, 22)));
        assert_eq!(store.count_forecasts(HorizonKind::SevenDay).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_forecaster_failure_persists_nothing() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let registry = ForecasterRegistry::new().with(HorizonKind::NextDay, Failing);
        let (svc, _) = service(
            store.clone(),
            registry,
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::NextDay).await;

        assert_eq!(result.stage, RunStage::Predict);
        assert_eq!(result.error_kind, Some(ErrorKind::ForecasterFailure));
        assert!(result.error.unwrap().contains("optimizer diverged"));
        assert_eq!(store.count_forecasts(HorizonKind::NextDay).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 1), 19, |_| 120.0).await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let guard = svc.locks.try_acquire(HorizonKind::NextDay).unwrap();

        let blocked = svc.run_forecast(HorizonKind::NextDay).await;
        assert_eq!(blocked.error_kind, Some(ErrorKind::RunInProgress));
        assert_eq!(
            svc.reconcile(HorizonKind::NextDay).await.unwrap_err(),
            ForecastError::RunInProgress(HorizonKind::NextDay)
        );

        // Other horizons are unaffected
        assert!(svc.run_forecast(HorizonKind::SevenDay).await.is_done());

        drop(guard);
        assert!(svc.run_forecast(HorizonKind::NextDay).await.is_done());
    }

    #[tokio::test]
    async fn test_timeout_fails_run_and_releases_lock() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let registry = ForecasterRegistry::new().with(
            HorizonKind::NextDay,
            Slow(std::time::Duration::from_millis(300)),
        );
        let config = PipelineConfig {
            run_timeout: std::time::Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let (svc, _) = service(store.clone(), registry, config, local_morning(date(6, 20)));

        let result = svc.run_forecast(HorizonKind::NextDay).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.stage, RunStage::Predict);
        assert!(svc.locks.try_acquire(HorizonKind::NextDay).is_ok());
        assert_eq!(store.count_forecasts(HorizonKind::NextDay).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_unavailable_is_reported() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        store.set_unavailable(true);
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::NextDay).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.stage, RunStage::LoadTraining);
        assert_eq!(result.error_kind, Some(ErrorKind::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_training_window_limits_history() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 1), 19, |_| 100.0).await;
        let mut config = PipelineConfig::default();
        config.next_day.training_days = 5;
        config.next_day.min_training_days = 6;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            config,
            local_morning(date(6, 20)),
        );

        let result = svc.run_forecast(HorizonKind::NextDay).await;
        assert_eq!(result.error_kind, Some(ErrorKind::InsufficientData));
        assert!(result.error.unwrap().contains("got 5"));
    }

    #[tokio::test]
    async fn test_accuracy_report_over_reconciled_records() {
        // ---
        let store = Arc::new(MemoryStore::new());
        seed(&store, date(6, 10), 10, |_| 100.0).await;
        let (svc, clock) = service(
            store.clone(),
            constant_registry(110.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        assert!(svc.run_forecast(HorizonKind::NextDay).await.is_done());
        seed(&store, date(6, 20), 2, |_| 100.0).await;
        clock.set(local_morning(date(6, 22)));
        svc.reconcile(HorizonKind::NextDay).await.unwrap();

        let report = svc
            .accuracy(HorizonKind::NextDay, date(6, 1), date(6, 30))
            .await
            .unwrap();
        assert_eq!(report.count, 1);
        assert!((report.metrics.mae - 10.0).abs() < 1e-9);
        assert!((report.metrics.mape - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_monthly_summary_sums_daily_output() {
        // ---
        let store = Arc::new(MemoryStore::new());
        // 4 days in May, 4 in June
        seed(&store, date(5, 28), 8, |i| 100.0 + i as f64).await;
        let (svc, _) = service(
            store.clone(),
            constant_registry(100.0),
            PipelineConfig::default(),
            local_morning(date(6, 20)),
        );

        let june = svc.summary(SummaryPeriod::Month, date(6, 15)).await.unwrap();
        assert_eq!(june.period, "2025-06");
        assert_eq!(june.from, date(6, 1));
        assert_eq!(june.to, date(6, 30));
        assert_eq!(june.readings, 96);
        assert!((june.total_mwh - (104.0 + 105.0 + 106.0 + 107.0)).abs() < 1e-6);
        assert_eq!(june.avg_temperature_c, Some(20.0));

        let day = svc.summary(SummaryPeriod::Day, date(5, 28)).await.unwrap();
        assert_eq!(day.readings, 24);
        assert!((day.total_mwh - 100.0).abs() < 1e-6);

        let year = svc.summary(SummaryPeriod::Year, date(1, 1)).await.unwrap();
        assert_eq!(year.period, "2025");
        assert_eq!(year.readings, 8 * 24);

        let empty_day = svc.summary(SummaryPeriod::Day, date(7, 1)).await.unwrap();
        assert_eq!(empty_day.readings, 0);
        assert_eq!(empty_day.total_mwh, 0.0);
        assert_eq!(empty_day.avg_irradiance_wm2, None);
    }

    #[test]
    fn test_fill_gaps_interpolates_interior_days() {
        // ---
        let point = |d: u32, value: f64| TrainingPoint {
            date: date(6, d),
            value,
            features: None,
        };
        let filled = fill_gaps(vec![point(1, 100.0), point(4, 130.0), point(5, 90.0)], &BTreeMap::new());

        let values: Vec<f64> = filled.iter().map(|p| p.value).collect();
        let dates: Vec<NaiveDate> = filled.iter().map(|p| p.date).collect();
        assert_eq!(dates, (1..=5).map(|d| date(6, d)).collect::<Vec<_>>());
        assert!((values[1] - 110.0).abs() < 1e-9);
        assert!((values[2] - 120.0).abs() < 1e-9);
        assert_eq!(values[4], 90.0);
    }
}
