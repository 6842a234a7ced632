//! PostgreSQL-backed store.
//!
//! Uniqueness is enforced by the primary keys created in `schema.rs`;
//! upserts rely on `ON CONFLICT` so concurrent writers to one key resolve
//! to last-write-wins inside the database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;

use super::{ActualRule, Coverage, ReadingStore, ReadingTotals};
use crate::{
    accuracy::Metrics,
    error::{ForecastError, Result},
    models::{ForecastKey, ForecastRecord, HorizonKind, Reading},
};

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

/// Row shape of the `forecast` table.
#[derive(Debug, sqlx::FromRow)]
struct ForecastRow {
    // ---
    horizon: String,
    forecast_start: NaiveDate,
    forecast_end: NaiveDate,
    predicted_mwh: f64,
    actual_mwh: Option<f64>,
    rmse: Option<f64>,
    mae: Option<f64>,
    mape: Option<f64>,
    created_at: DateTime<Utc>,
    reconciled_at: Option<DateTime<Utc>>,
}

impl TryFrom<ForecastRow> for ForecastRecord {
    type Error = ForecastError;

    fn try_from(row: ForecastRow) -> Result<Self> {
        // ---
        let horizon = row
            .horizon
            .parse::<HorizonKind>()
            .map_err(ForecastError::InvalidInput)?;

        Ok(ForecastRecord {
            horizon,
            forecast_start: row.forecast_start,
            forecast_end: row.forecast_end,
            predicted_mwh: row.predicted_mwh,
            actual_mwh: row.actual_mwh,
            rmse: row.rmse,
            mae: row.mae,
            mape: row.mape,
            created_at: row.created_at,
            reconciled_at: row.reconciled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TotalsRow {
    readings: i64,
    total_mwh: Option<f64>,
    avg_irradiance_wm2: Option<f64>,
    avg_temperature_c: Option<f64>,
}

const FORECAST_COLUMNS: &str = "horizon, forecast_start, forecast_end, predicted_mwh, \
     actual_mwh, rmse, mae, mape, created_at, reconciled_at";

fn unavailable(e: sqlx::Error) -> ForecastError {
    ForecastError::StoreUnavailable(e.to_string())
}

fn persistence(key: ForecastKey, e: sqlx::Error) -> ForecastError {
    ForecastError::PersistenceFailure(format!("{key}: {e}"))
}

fn into_records(rows: Vec<ForecastRow>) -> Result<Vec<ForecastRecord>> {
    rows.into_iter().map(ForecastRecord::try_from).collect()
}

#[async_trait]
impl ReadingStore for PgStore {
    // ---
    async fn upsert(&self, reading: &Reading) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO measurement (
                measured_at, cumulative_mwh, power_mw,
                forecast_irradiance_wm2, forecast_temperature_c, forecast_wind_speed_ms
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (measured_at) DO UPDATE SET
                cumulative_mwh          = EXCLUDED.cumulative_mwh,
                power_mw                = EXCLUDED.power_mw,
                forecast_irradiance_wm2 = EXCLUDED.forecast_irradiance_wm2,
                forecast_temperature_c  = EXCLUDED.forecast_temperature_c,
                forecast_wind_speed_ms  = EXCLUDED.forecast_wind_speed_ms,
                updated_at              = NOW()
            "#,
        )
        .bind(reading.measured_at)
        .bind(reading.cumulative_mwh)
        .bind(reading.power_mw)
        .bind(reading.forecast_irradiance_wm2)
        .bind(reading.forecast_temperature_c)
        .bind(reading.forecast_wind_speed_ms)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn read_series(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>> {
        // ---
        sqlx::query_as::<_, Reading>(
            r#"
            SELECT measured_at, cumulative_mwh, power_mw,
                   forecast_irradiance_wm2, forecast_temperature_c, forecast_wind_speed_ms
            FROM measurement
            WHERE measured_at >= $1 AND measured_at < $2
            ORDER BY measured_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn read_actual(
        &self,
        rule: ActualRule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // ---
        let query = match rule {
            ActualRule::CounterDelta => sqlx::query_scalar::<_, Option<f64>>(
                r#"
                SELECT MAX(cumulative_mwh) - MIN(cumulative_mwh)
                FROM measurement
                WHERE measured_at >= $1 AND measured_at < $2
                "#,
            )
            .bind(from)
            .bind(to),
            ActualRule::DaylightSum {
                first_hour,
                last_hour,
                tz,
            } => sqlx::query_scalar::<_, Option<f64>>(
                r#"
                SELECT SUM(power_mw)
                FROM measurement
                WHERE measured_at >= $1 AND measured_at < $2
                  AND EXTRACT(HOUR FROM measured_at AT TIME ZONE $3) BETWEEN $4 AND $5
                "#,
            )
            .bind(from)
            .bind(to)
            .bind(tz.name())
            .bind(first_hour as i32)
            .bind(last_hour as i32),
        };

        query.fetch_one(&self.pool).await.map_err(unavailable)
    }

    async fn read_coverage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Coverage> {
        // ---
        let (count, last_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(measured_at)
            FROM measurement
            WHERE measured_at >= $1 AND measured_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(Coverage {
            readings: count.max(0) as usize,
            last_at,
        })
    }

    async fn read_totals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tz: Tz,
    ) -> Result<ReadingTotals> {
        // ---
        let row: TotalsRow = sqlx::query_as(
            r#"
            WITH days AS (
                SELECT MAX(cumulative_mwh) - MIN(cumulative_mwh) AS delta_mwh
                FROM measurement
                WHERE measured_at >= $1 AND measured_at < $2
                GROUP BY (measured_at AT TIME ZONE $3)::date
            )
            SELECT
                (SELECT COUNT(*) FROM measurement
                  WHERE measured_at >= $1 AND measured_at < $2) AS readings,
                (SELECT SUM(delta_mwh) FROM days) AS total_mwh,
                (SELECT AVG(forecast_irradiance_wm2) FROM measurement
                  WHERE measured_at >= $1 AND measured_at < $2) AS avg_irradiance_wm2,
                (SELECT AVG(forecast_temperature_c) FROM measurement
                  WHERE measured_at >= $1 AND measured_at < $2) AS avg_temperature_c
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(tz.name())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(ReadingTotals {
            readings: row.readings.max(0) as usize,
            total_mwh: row.total_mwh,
            avg_irradiance_wm2: row.avg_irradiance_wm2,
            avg_temperature_c: row.avg_temperature_c,
        })
    }

    async fn upsert_forecast(&self, record: &ForecastRecord) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO forecast (
                horizon, forecast_start, forecast_end, predicted_mwh,
                actual_mwh, rmse, mae, mape, created_at, reconciled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (horizon, forecast_start) DO UPDATE SET
                forecast_end  = EXCLUDED.forecast_end,
                predicted_mwh = EXCLUDED.predicted_mwh,
                actual_mwh    = EXCLUDED.actual_mwh,
                rmse          = EXCLUDED.rmse,
                mae           = EXCLUDED.mae,
                mape          = EXCLUDED.mape,
                created_at    = EXCLUDED.created_at,
                reconciled_at = EXCLUDED.reconciled_at
            "#,
        )
        .bind(record.horizon.as_str())
        .bind(record.forecast_start)
        .bind(record.forecast_end)
        .bind(record.predicted_mwh)
        .bind(record.actual_mwh)
        .bind(record.rmse)
        .bind(record.mae)
        .bind(record.mape)
        .bind(record.created_at)
        .bind(record.reconciled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| persistence(record.key(), e))?;

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
        let finite = |v: f64| v.is_finite().then_some(v);

        let result = sqlx::query(
            r#"
            UPDATE forecast
            SET actual_mwh = $3, rmse = $4, mae = $5, mape = $6, reconciled_at = $7
            WHERE horizon = $1 AND forecast_start = $2 AND actual_mwh IS NULL
            "#,
        )
        .bind(key.horizon.as_str())
        .bind(key.forecast_start)
        .bind(actual_mwh)
        .bind(finite(metrics.rmse))
        .bind(finite(metrics.mae))
        .bind(finite(metrics.mape))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| persistence(*key, e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_forecasts(
        &self,
        horizon: HorizonKind,
        before: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        // ---
        let sql = format!(
            "SELECT {FORECAST_COLUMNS} FROM forecast \
             WHERE horizon = $1 AND actual_mwh IS NULL AND forecast_end < $2 \
             ORDER BY forecast_start"
        );
        let rows = sqlx::query_as::<_, ForecastRow>(&sql)
            .bind(horizon.as_str())
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        into_records(rows)
    }

    async fn read_forecasts(
        &self,
        horizon: HorizonKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        // ---
        let sql = format!(
            "SELECT {FORECAST_COLUMNS} FROM forecast \
             WHERE horizon = $1 AND forecast_start >= $2 AND forecast_end <= $3 \
             ORDER BY forecast_start"
        );
        let rows = sqlx::query_as::<_, ForecastRow>(&sql)
            .bind(horizon.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        into_records(rows)
    }

    async fn count_forecasts(&self, horizon: HorizonKind) -> Result<usize> {
        // ---
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM forecast WHERE horizon = $1")
            .bind(horizon.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(count.max(0) as usize)
    }
}
