//! Database schema management for `codemetal-solarcast`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `measurement` table for ingested readings and the `forecast`
/// table for persisted predictions. Safe to call on every startup; no-op if
/// objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // One row per timestamp; upserts overwrite measured and forecast inputs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurement (
            measured_at             TIMESTAMPTZ PRIMARY KEY,
            cumulative_mwh          DOUBLE PRECISION,
            power_mw                DOUBLE PRECISION,
            forecast_irradiance_wm2 DOUBLE PRECISION,
            forecast_temperature_c  DOUBLE PRECISION,
            forecast_wind_speed_ms  DOUBLE PRECISION,
            created_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at              TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One row per (horizon, first forecast day)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forecast (
            horizon        TEXT             NOT NULL,
            forecast_start DATE             NOT NULL,
            forecast_end   DATE             NOT NULL,
            predicted_mwh  DOUBLE PRECISION NOT NULL,
            actual_mwh     DOUBLE PRECISION,
            rmse           DOUBLE PRECISION,
            mae            DOUBLE PRECISION,
            mape           DOUBLE PRECISION,
            created_at     TIMESTAMPTZ      NOT NULL,
            reconciled_at  TIMESTAMPTZ,
            PRIMARY KEY (horizon, forecast_start)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Reconciliation scans for rows still missing their actual
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_forecast_pending
            ON forecast (horizon, forecast_end)
            WHERE actual_mwh IS NULL;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
